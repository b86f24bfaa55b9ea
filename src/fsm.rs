// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::commands::{send_command, Command};
use crate::conn::Conn;
use crate::error::{BridgeError, Result};
use crate::mqtt::MqttHandler;

/// Lifecycle states of a cover device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverState {
    Initial,
    Online,
    Offline,
    Opening,
    Closing,
    Open,
    Closed,
    Stopping,
    Stopped,
}

impl CoverState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverState::Initial => "initial",
            CoverState::Online => "online",
            CoverState::Offline => "offline",
            CoverState::Opening => "opening",
            CoverState::Closing => "closing",
            CoverState::Open => "open",
            CoverState::Closed => "closed",
            CoverState::Stopping => "stopping",
            CoverState::Stopped => "stopped",
        }
    }
}

/// Events that drive a cover device between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverEvent {
    GoOnline,
    GoOffline,
    GoOpen,
    GoClose,
    GoStop,
    GoStopped,
    GoOpened,
    GoClosed,
}

impl CoverEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverEvent::GoOnline => "go_online",
            CoverEvent::GoOffline => "go_offline",
            CoverEvent::GoOpen => "go_open",
            CoverEvent::GoClose => "go_close",
            CoverEvent::GoStop => "go_stop",
            CoverEvent::GoStopped => "go_stopped",
            CoverEvent::GoOpened => "go_opened",
            CoverEvent::GoClosed => "go_closed",
        }
    }
}

/// The transition table. Returns the destination state, or `None` when the
/// event is illegal from the given state.
pub fn transition(from: CoverState, event: CoverEvent) -> Option<CoverState> {
    use CoverEvent::*;
    use CoverState::*;

    match (event, from) {
        (GoOnline, Initial | Offline) => Some(Online),
        (GoOffline, Online | Opening | Closing | Open | Closed | Stopping | Stopped) => {
            Some(Offline)
        }
        (GoOpen, Online | Closed | Stopped) => Some(Opening),
        (GoClose, Online | Open | Stopped) => Some(Closing),
        (GoStop, Online | Opening | Open | Closing | Closed) => Some(Stopping),
        (GoStopped, Stopping) => Some(Stopped),
        (GoOpened, Online | Opening | Open | Closing | Closed | Stopping | Stopped) => Some(Open),
        (GoClosed, Online | Opening | Open | Closing | Closed | Stopping | Stopped) => Some(Closed),
        _ => None,
    }
}

/// The terminal event implied by a reported position, if any.
///
/// Only the extremes drive transitions; intermediate positions leave the
/// state machine alone.
pub fn terminal_event_for_position(position: i32) -> Option<CoverEvent> {
    match position {
        100 => Some(CoverEvent::GoOpened),
        0 => Some(CoverEvent::GoClosed),
        _ => None,
    }
}

/// Whether the status driver should skip a terminal event.
///
/// Redundant events (already in the target state) and contradictory ones
/// mid-motion (a closed report while opening, and vice versa) are elided
/// so the published state doesn't flicker before the device settles.
pub fn should_elide(current: CoverState, event: CoverEvent) -> bool {
    match event {
        CoverEvent::GoOpened => matches!(current, CoverState::Open | CoverState::Closing),
        CoverEvent::GoClosed => matches!(current, CoverState::Closed | CoverState::Opening),
        _ => false,
    }
}

/// The state machine for one cover device.
///
/// State is guarded by an internal lock held only for the transition
/// decision itself; entry effects run after it is released, on whichever
/// task triggered the event. External observers see [`current`](Self::current)
/// only.
pub struct DeviceFsm {
    id: String,
    prefix: String,
    conn: Arc<Conn>,
    mqtt: Arc<MqttHandler>,
    state: Mutex<CoverState>,
}

impl DeviceFsm {
    pub fn new(id: impl Into<String>, prefix: impl Into<String>, conn: Arc<Conn>, mqtt: Arc<MqttHandler>) -> Self {
        Self {
            id: id.into(),
            prefix: prefix.into(),
            conn,
            mqtt,
            state: Mutex::new(CoverState::Initial),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current state, consistent with the last completed transition.
    pub fn current(&self) -> CoverState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Trigger an event.
    ///
    /// Illegal transitions are logged and returned as a non-fatal error;
    /// the state is unchanged and no effects run.
    pub async fn trigger(&self, event: CoverEvent) -> Result<()> {
        let destination = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match transition(*state, event) {
                Some(destination) => {
                    debug!(
                        device = %self.id,
                        event = event.as_str(),
                        src = state.as_str(),
                        dst = destination.as_str(),
                        "transition"
                    );
                    *state = destination;
                    destination
                }
                None => {
                    warn!(
                        device = %self.id,
                        event = event.as_str(),
                        state = state.as_str(),
                        "illegal transition"
                    );
                    return Err(BridgeError::IllegalTransition {
                        event: event.as_str(),
                        from: state.as_str(),
                    });
                }
            }
        };

        self.enter(destination).await;
        Ok(())
    }

    /// Entry effects. Command failures are logged and the state stands;
    /// the next status report corrects any divergence.
    async fn enter(&self, state: CoverState) {
        match state {
            CoverState::Online => {
                if let Err(e) = self
                    .mqtt
                    .publish_availability(&self.prefix, &self.id, "online")
                    .await
                {
                    error!(device = %self.id, error = %e, "error setting device online");
                    return;
                }
                info!(device = %self.id, "device is online");
            }
            CoverState::Offline => {
                if let Err(e) = self
                    .mqtt
                    .publish_availability(&self.prefix, &self.id, "offline")
                    .await
                {
                    error!(device = %self.id, error = %e, "error setting device offline");
                    return;
                }
                info!(device = %self.id, "device is offline");
            }
            CoverState::Opening => {
                self.publish_state("opening").await;
                if let Err(e) = send_command(&self.conn, &self.id, Command::Open).await {
                    error!(device = %self.id, error = %e, "error sending open command");
                }
            }
            CoverState::Closing => {
                self.publish_state("closing").await;
                if let Err(e) = send_command(&self.conn, &self.id, Command::Close).await {
                    error!(device = %self.id, error = %e, "error sending close command");
                }
            }
            CoverState::Stopping => {
                self.publish_state("stopping").await;
                if let Err(e) = send_command(&self.conn, &self.id, Command::Stop).await {
                    error!(device = %self.id, error = %e, "error sending stop command");
                }
            }
            CoverState::Open => {
                self.publish_state("open").await;
                info!(device = %self.id, "device is fully open");
            }
            CoverState::Closed => {
                self.publish_state("closed").await;
                info!(device = %self.id, "device is fully closed");
            }
            CoverState::Stopped | CoverState::Initial => {}
        }
    }

    async fn publish_state(&self, state: &str) {
        if let Err(e) = self.mqtt.publish_status(&self.prefix, &self.id, state).await {
            error!(device = %self.id, state, error = %e, "error publishing state");
        }
    }
}

/// Process-wide registry of device state machines.
///
/// Reads are concurrent, writes serialized; iteration hands out a
/// defensive copy so callers may trigger events (which relock) freely.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<HashMap<String, Arc<DeviceFsm>>>,
}

impl DeviceRegistry {
    pub fn get(&self, id: &str) -> Option<Arc<DeviceFsm>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn insert(&self, fsm: Arc<DeviceFsm>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fsm.id().to_string(), fsm);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// A snapshot of all registered machines.
    pub fn snapshot(&self) -> Vec<Arc<DeviceFsm>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove and return all registered machines (shutdown).
    pub fn drain(&self) -> Vec<Arc<DeviceFsm>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, fsm)| fsm)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CoverEvent::*;
    use CoverState::*;

    const ALL_STATES: [CoverState; 9] = [
        Initial, Online, Offline, Opening, Closing, Open, Closed, Stopping, Stopped,
    ];
    const ALL_EVENTS: [CoverEvent; 8] = [
        GoOnline, GoOffline, GoOpen, GoClose, GoStop, GoStopped, GoOpened, GoClosed,
    ];

    #[test]
    fn test_transition_table_rows() {
        assert_eq!(transition(Initial, GoOnline), Some(Online));
        assert_eq!(transition(Offline, GoOnline), Some(Online));

        for from in [Online, Opening, Closing, Open, Closed, Stopping, Stopped] {
            assert_eq!(transition(from, GoOffline), Some(Offline), "from {:?}", from);
        }

        assert_eq!(transition(Online, GoOpen), Some(Opening));
        assert_eq!(transition(Closed, GoOpen), Some(Opening));
        assert_eq!(transition(Stopped, GoOpen), Some(Opening));

        assert_eq!(transition(Online, GoClose), Some(Closing));
        assert_eq!(transition(Open, GoClose), Some(Closing));
        assert_eq!(transition(Stopped, GoClose), Some(Closing));

        for from in [Online, Opening, Open, Closing, Closed] {
            assert_eq!(transition(from, GoStop), Some(Stopping), "from {:?}", from);
        }
        assert_eq!(transition(Stopping, GoStopped), Some(Stopped));

        for from in [Online, Opening, Open, Closing, Closed, Stopping, Stopped] {
            assert_eq!(transition(from, GoOpened), Some(Open), "from {:?}", from);
            assert_eq!(transition(from, GoClosed), Some(Closed), "from {:?}", from);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        // Opening straight from initial must go via online.
        assert_eq!(transition(Initial, GoOpen), None);
        assert_eq!(transition(Initial, GoClose), None);
        assert_eq!(transition(Initial, GoOpened), None);
        assert_eq!(transition(Initial, GoOffline), None);

        assert_eq!(transition(Opening, GoOpen), None);
        assert_eq!(transition(Open, GoOpen), None);
        assert_eq!(transition(Closing, GoClose), None);
        assert_eq!(transition(Offline, GoOpen), None);
        assert_eq!(transition(Offline, GoOffline), None);
        assert_eq!(transition(Stopping, GoStop), None);
        assert_eq!(transition(Stopped, GoStopped), None);
        assert_eq!(transition(Stopped, GoStop), None);
    }

    #[test]
    fn test_reachable_states_from_initial() {
        // Breadth-first closure over the transition table: every state
        // except initial itself comes back.
        let mut reachable = vec![Initial];
        let mut frontier = vec![Initial];
        while let Some(state) = frontier.pop() {
            for event in ALL_EVENTS {
                if let Some(next) = transition(state, event) {
                    if !reachable.contains(&next) {
                        reachable.push(next);
                        frontier.push(next);
                    }
                }
            }
        }
        for state in ALL_STATES {
            assert!(reachable.contains(&state), "{:?} unreachable", state);
        }
        // And initial is never re-entered.
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                assert_ne!(transition(state, event), Some(Initial));
            }
        }
    }

    #[test]
    fn test_terminal_event_for_position() {
        assert_eq!(terminal_event_for_position(100), Some(GoOpened));
        assert_eq!(terminal_event_for_position(0), Some(GoClosed));
        assert_eq!(terminal_event_for_position(1), None);
        assert_eq!(terminal_event_for_position(50), None);
        assert_eq!(terminal_event_for_position(99), None);
    }

    #[test]
    fn test_driver_elision() {
        // Redundant: already at the terminal state.
        assert!(should_elide(Open, GoOpened));
        assert!(should_elide(Closed, GoClosed));
        // Contradictory mid-motion.
        assert!(should_elide(Opening, GoClosed));
        assert!(should_elide(Closing, GoOpened));
        // Natural completions pass through.
        assert!(!should_elide(Opening, GoOpened));
        assert!(!should_elide(Closing, GoClosed));
        assert!(!should_elide(Online, GoOpened));
        assert!(!should_elide(Stopping, GoClosed));
    }

    #[test]
    fn test_state_and_event_names() {
        assert_eq!(Opening.as_str(), "opening");
        assert_eq!(Stopped.as_str(), "stopped");
        assert_eq!(GoOnline.as_str(), "go_online");
        assert_eq!(GoOpened.as_str(), "go_opened");
    }
}
