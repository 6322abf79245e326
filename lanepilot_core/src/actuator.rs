//! Actuator dispatcher - lane-switch commands to servo angles.
//!
//! For `switch from-->to` every servo of the source lane, then every servo
//! of the destination lane, is driven to
//!
//! ```text
//!   180 + turning_degree   when from < to
//!   180 - turning_degree   when from > to
//! ```
//!
//! with the sign swapped when `reverse_direction` is set. A failed write
//! abandons that one switch; the dispatcher keeps serving.

use crate::command_channel::CommandListener;
use crate::wire::{CommandMessage, LaneSwitch};
use lanepilot_env::Fault;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Valid servo positions in degrees.
pub const ANGLE_RANGE: std::ops::RangeInclusive<i32> = 0..=360;

const NEUTRAL_ANGLE: i32 = 180;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("Lane {0} is negative")]
    NegativeLane(i64),

    #[error("Lane {0} has no servos configured")]
    UnknownLane(i64),

    #[error("Angle {0} is outside 0..=360")]
    AngleOutOfRange(i32),

    #[error("Servo {servo_id} write failed: {reason}")]
    WriteFailed { servo_id: u8, reason: String },

    #[error("Servo release failed: {0}")]
    ReleaseFailed(String),

    #[error("Dispatcher already disposed")]
    Disposed,
}

impl From<ActuatorError> for Fault {
    fn from(err: ActuatorError) -> Self {
        Fault::actuator(err.to_string())
    }
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Servo bus driver.
pub trait ServoDriver: Send {
    fn set_angle(&mut self, servo_id: u8, degrees: i32) -> Result<(), ActuatorError>;

    /// Turns torque off on every servo.
    fn release(&mut self) -> Result<(), ActuatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Straight,
    Left,
    Right,
}

impl Direction {
    /// Sign of `to - from`.
    pub fn of(switch: LaneSwitch) -> Self {
        match switch.to.cmp(&switch.from) {
            std::cmp::Ordering::Greater => Self::Right,
            std::cmp::Ordering::Less => Self::Left,
            std::cmp::Ordering::Equal => Self::Straight,
        }
    }
}

/// Anything that can display the current direction.
pub trait DirectionIndicator: Send + Sync {
    fn show(&self, direction: Direction);
}

/// In-process indicator; displays subscribe to changes.
pub struct SharedDirection {
    tx: watch::Sender<Direction>,
}

impl SharedDirection {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Direction::Straight);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Direction> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Direction {
        *self.tx.borrow()
    }
}

impl Default for SharedDirection {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionIndicator for SharedDirection {
    fn show(&self, direction: Direction) {
        self.tx.send_replace(direction);
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Deflection from the neutral 180° position
    pub turning_degree: i32,

    /// Mirror the turn (servos mounted the other way round)
    #[serde(default)]
    pub reverse_direction: bool,

    /// Servo ids per lane
    #[serde(default)]
    pub lane_servos: BTreeMap<i64, Vec<u8>>,
}

impl ActuatorConfig {
    /// Target angle for a switch between two different lanes.
    pub fn turn_angle(&self, switch: LaneSwitch) -> i32 {
        let increasing = (switch.from < switch.to) != self.reverse_direction;
        if increasing {
            NEUTRAL_ANGLE.saturating_add(self.turning_degree)
        } else {
            NEUTRAL_ANGLE.saturating_sub(self.turning_degree)
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct ActuatorDispatcher {
    config: ActuatorConfig,
    driver: Mutex<Box<dyn ServoDriver>>,
    indicator: Option<Arc<dyn DirectionIndicator>>,
    disposed: AtomicBool,
}

impl ActuatorDispatcher {
    pub fn new(config: ActuatorConfig, driver: Box<dyn ServoDriver>) -> Self {
        Self {
            config,
            driver: Mutex::new(driver),
            indicator: None,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn DirectionIndicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    fn servos(&self, lane: i64) -> Result<&[u8], ActuatorError> {
        if lane < 0 {
            return Err(ActuatorError::NegativeLane(lane));
        }
        self.config
            .lane_servos
            .get(&lane)
            .map(Vec::as_slice)
            .ok_or(ActuatorError::UnknownLane(lane))
    }

    /// Drives the servos of both lanes. `Ok(None)` when `from == to`.
    pub fn apply_switch(&self, switch: LaneSwitch) -> Result<Option<i32>, ActuatorError> {
        if self.is_disposed() {
            return Err(ActuatorError::Disposed);
        }

        let source = self.servos(switch.from)?;
        let destination = self.servos(switch.to)?;
        if switch.from == switch.to {
            debug!(lane = switch.from, "Switch within the same lane ignored");
            return Ok(None);
        }

        let angle = self.config.turn_angle(switch);
        if !ANGLE_RANGE.contains(&angle) {
            return Err(ActuatorError::AngleOutOfRange(angle));
        }

        {
            let mut driver = self.driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for &servo_id in source.iter().chain(destination) {
                driver.set_angle(servo_id, angle)?;
            }
        }

        if let Some(indicator) = &self.indicator {
            indicator.show(Direction::of(switch));
        }
        info!(switch = %switch, angle, "Servos moved");
        Ok(Some(angle))
    }

    /// Releases servo torque. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut driver = self.driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match driver.release() {
            Ok(()) => info!("Servos released"),
            Err(e) => error!("{}", e),
        }
        if let Some(indicator) = &self.indicator {
            indicator.show(Direction::Straight);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl CommandListener for ActuatorDispatcher {
    fn name(&self) -> &str {
        "actuator-dispatcher"
    }

    fn on_command(&self, message: &CommandMessage) -> Result<Option<CommandMessage>, Fault> {
        match message.command.as_str() {
            "switch" => {
                let switch = LaneSwitch::from_value(&message.value)?;
                self.apply_switch(switch).map_err(|e| {
                    error!(switch = %switch, "Switch abandoned: {}", e);
                    Fault::from(e)
                })?;
                Ok(None)
            }
            "exit" => {
                self.dispose();
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct RecordingDriver {
        writes: Arc<Mutex<Vec<(u8, i32)>>>,
        releases: Arc<Mutex<u32>>,
        broken_servo: Option<u8>,
    }

    impl ServoDriver for RecordingDriver {
        fn set_angle(&mut self, servo_id: u8, degrees: i32) -> Result<(), ActuatorError> {
            if self.broken_servo == Some(servo_id) {
                return Err(ActuatorError::WriteFailed {
                    servo_id,
                    reason: "no ack".into(),
                });
            }
            self.writes.lock().unwrap().push((servo_id, degrees));
            Ok(())
        }

        fn release(&mut self) -> Result<(), ActuatorError> {
            *self.releases.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn config(reverse_direction: bool) -> ActuatorConfig {
        ActuatorConfig {
            turning_degree: 30,
            reverse_direction,
            lane_servos: BTreeMap::from([(0, vec![1]), (1, vec![2]), (2, vec![3, 4])]),
        }
    }

    fn dispatcher(reverse: bool) -> (ActuatorDispatcher, RecordingDriver) {
        let driver = RecordingDriver::default();
        (ActuatorDispatcher::new(config(reverse), Box::new(driver.clone())), driver)
    }

    #[test]
    fn test_switch_zero_to_two_turns_210_on_both_lanes() {
        let (dispatcher, driver) = dispatcher(false);
        dispatcher
            .on_command(&CommandMessage::new("switch", "0-->2"))
            .unwrap();

        assert_eq!(*driver.writes.lock().unwrap(), vec![(1, 210), (3, 210), (4, 210)]);
    }

    #[test]
    fn test_angle_sign_and_reverse() {
        let (forward, _) = dispatcher(false);
        assert_eq!(forward.apply_switch(LaneSwitch::new(2, 1)), Ok(Some(150)));

        let (reversed, _) = dispatcher(true);
        assert_eq!(reversed.apply_switch(LaneSwitch::new(0, 2)), Ok(Some(150)));
        assert_eq!(reversed.apply_switch(LaneSwitch::new(2, 0)), Ok(Some(210)));
    }

    #[test]
    fn test_same_lane_is_noop() {
        let (dispatcher, driver) = dispatcher(false);
        assert_eq!(dispatcher.apply_switch(LaneSwitch::new(1, 1)), Ok(None));
        assert!(driver.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_lanes_rejected_without_writes() {
        let (dispatcher, driver) = dispatcher(false);
        assert_eq!(dispatcher.apply_switch(LaneSwitch::new(-1, 0)), Err(ActuatorError::NegativeLane(-1)));
        assert_eq!(dispatcher.apply_switch(LaneSwitch::new(0, 7)), Err(ActuatorError::UnknownLane(7)));
        assert!(driver.writes.lock().unwrap().is_empty());

        let result = dispatcher.on_command(&CommandMessage::new("switch", json!({"bad": true})));
        assert!(matches!(result, Err(Fault::Protocol(_))));
    }

    #[test]
    fn test_out_of_range_angle_rejected() {
        let driver = RecordingDriver::default();
        let dispatcher = ActuatorDispatcher::new(
            ActuatorConfig {
                turning_degree: 200,
                ..config(false)
            },
            Box::new(driver.clone()),
        );
        assert_eq!(
            dispatcher.apply_switch(LaneSwitch::new(2, 0)),
            Err(ActuatorError::AngleOutOfRange(-20))
        );
        assert!(driver.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_extreme_turning_degree_saturates() {
        let driver = RecordingDriver::default();
        let dispatcher = ActuatorDispatcher::new(
            ActuatorConfig {
                turning_degree: i32::MAX,
                ..config(false)
            },
            Box::new(driver.clone()),
        );
        assert_eq!(
            dispatcher.apply_switch(LaneSwitch::new(0, 1)),
            Err(ActuatorError::AngleOutOfRange(i32::MAX))
        );
        assert_eq!(
            dispatcher.apply_switch(LaneSwitch::new(1, 0)),
            Err(ActuatorError::AngleOutOfRange(180 - i32::MAX))
        );

        let negative = ActuatorConfig {
            turning_degree: i32::MIN,
            ..config(false)
        };
        assert_eq!(negative.turn_angle(LaneSwitch::new(1, 0)), i32::MAX);
        assert!(driver.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_abandons_only_that_switch() {
        let driver = RecordingDriver {
            broken_servo: Some(3),
            ..RecordingDriver::default()
        };
        let dispatcher = ActuatorDispatcher::new(config(false), Box::new(driver.clone()));

        let result = dispatcher.on_command(&CommandMessage::new("switch", "0-->2"));
        assert!(matches!(result, Err(Fault::Actuator(_))));

        dispatcher.on_command(&CommandMessage::new("switch", "1-->0")).unwrap();
        assert_eq!(*driver.writes.lock().unwrap(), vec![(1, 210), (2, 150), (1, 150)]);
    }

    #[test]
    fn test_direction_indicator_follows_switches() {
        let indicator = Arc::new(SharedDirection::new());
        let mut display = indicator.subscribe();
        let driver = RecordingDriver::default();
        let dispatcher = ActuatorDispatcher::new(config(true), Box::new(driver)).with_indicator(indicator.clone());

        dispatcher.apply_switch(LaneSwitch::new(0, 1)).unwrap();
        assert!(display.has_changed().unwrap());
        assert_eq!(*display.borrow_and_update(), Direction::Right);

        dispatcher.apply_switch(LaneSwitch::new(2, 1)).unwrap();
        assert_eq!(indicator.current(), Direction::Left);
    }

    #[test]
    fn test_exit_and_dispose_release_once() {
        let (dispatcher, driver) = dispatcher(false);
        dispatcher.on_command(&CommandMessage::exit()).unwrap();
        dispatcher.dispose();
        dispatcher.dispose();

        assert_eq!(*driver.releases.lock().unwrap(), 1);
        assert_eq!(dispatcher.apply_switch(LaneSwitch::new(0, 1)), Err(ActuatorError::Disposed));
    }
}
