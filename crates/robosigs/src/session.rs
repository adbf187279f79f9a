use crate::error::SignalError;
use robosig_common::{Outbound, Role};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Process-unique identifier of an accepted connection.
pub type ConnId = u64;

/// Handle held in a role slot, used to push frames to that connection's task.
///
/// The slot owns the only long-lived sender. Dropping the handle when the
/// slot is overwritten closes the channel, which ends the displaced task.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// Channel sender into the connection's write side.
    pub tx: mpsc::Sender<Outbound>,
    /// Connection that owns the receiving end.
    pub conn_id: ConnId,
}

/// Notifications owed after a successful registration.
#[derive(Debug, Default)]
pub struct Registration {
    /// The registering robot must be sent `READY` right after its ack.
    pub ready_to_self: bool,
    /// The already-registered robot must be sent `READY`.
    pub notify_robot: Option<PeerHandle>,
    /// Connection that previously held the slot and was displaced.
    pub displaced: Option<PeerHandle>,
}

/// Point-in-time view of the session, for logs, metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    /// Connection id holding the robot slot.
    pub robot: Option<ConnId>,
    /// Connection id holding the client slot.
    pub client: Option<ConnId>,
    /// A client is registered and the next robot must be sent `READY`.
    pub waiting_for_robot: bool,
}

/// The robot/client pairing.
///
/// Every method is synchronous: a transition is a single step with no
/// suspension point, so the one-robot/one-client invariant holds under any
/// interleaving of connection tasks.
#[derive(Debug, Default)]
pub struct Session {
    robot: Option<PeerHandle>,
    client: Option<PeerHandle>,
    waiting_for_robot: bool,
}

impl Session {
    fn slot(&self, role: Role) -> &Option<PeerHandle> {
        match role {
            Role::Robot => &self.robot,
            Role::Client => &self.client,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<PeerHandle> {
        match role {
            Role::Robot => &mut self.robot,
            Role::Client => &mut self.client,
        }
    }

    /// Put `handle` into the slot for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::DuplicateRole`] if a robot is already
    /// registered. The session is left untouched in that case.
    pub fn register(&mut self, role: Role, handle: PeerHandle) -> Result<Registration, SignalError> {
        match role {
            Role::Robot => {
                if self.robot.is_some() {
                    return Err(SignalError::DuplicateRole);
                }
                self.robot = Some(handle);
                let ready_to_self = std::mem::take(&mut self.waiting_for_robot);
                Ok(Registration {
                    ready_to_self,
                    ..Registration::default()
                })
            }
            Role::Client => {
                let displaced = self.client.replace(handle);
                let notify_robot = self.robot.clone();
                self.waiting_for_robot = notify_robot.is_none();
                Ok(Registration {
                    ready_to_self: false,
                    notify_robot,
                    displaced,
                })
            }
        }
    }

    /// Clear the slot for `role` if it is still held by `conn_id`.
    ///
    /// Returns `true` if the slot was cleared.
    pub fn release(&mut self, role: Role, conn_id: ConnId) -> bool {
        let slot = self.slot_mut(role);
        if !slot.as_ref().is_some_and(|h| h.conn_id == conn_id) {
            return false;
        }
        *slot = None;
        // READY is owed exactly when a client is present and the robot is not
        self.waiting_for_robot = self.client.is_some() && self.robot.is_none();
        true
    }

    /// Resolve the relay target for a frame sent by `conn_id` in `role`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Displaced`] if `conn_id` no longer holds its
    /// slot, or [`SignalError::PeerUnavailable`] if the opposite slot is
    /// empty.
    pub fn route(&self, role: Role, conn_id: ConnId) -> Result<PeerHandle, SignalError> {
        if !self.holds(role, conn_id) {
            return Err(SignalError::Displaced(role));
        }
        let target = role.opposite();
        self.slot(target)
            .clone()
            .ok_or(SignalError::PeerUnavailable(target))
    }

    /// Whether `conn_id` currently holds the slot for `role`.
    #[must_use]
    pub fn holds(&self, role: Role, conn_id: ConnId) -> bool {
        self.slot(role).as_ref().is_some_and(|h| h.conn_id == conn_id)
    }

    /// Current occupancy.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            robot: self.robot.as_ref().map(|h| h.conn_id),
            client: self.client.as_ref().map(|h| h.conn_id),
            waiting_for_robot: self.waiting_for_robot,
        }
    }
}

/// Shared owner of the [`Session`].
///
/// The lock is only ever taken for one [`Session`] call and never held
/// across an `.await`. Serving several independent pairings would mean
/// keying a map of sessions here; `Session` itself would not change.
#[derive(Debug, Default)]
pub struct Registry {
    session: Mutex<Session>,
    next_conn_id: AtomicU64,
}

impl Registry {
    /// Create a registry with both roles vacant.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        // Session methods cannot panic halfway through a transition
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id for a newly accepted connection.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// See [`Session::register`].
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::DuplicateRole`] for a second robot.
    pub fn register(&self, role: Role, handle: PeerHandle) -> Result<Registration, SignalError> {
        self.lock().register(role, handle)
    }

    /// See [`Session::release`].
    pub fn release(&self, role: Role, conn_id: ConnId) -> bool {
        self.lock().release(role, conn_id)
    }

    /// See [`Session::route`].
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Displaced`] or [`SignalError::PeerUnavailable`].
    pub fn route(&self, role: Role, conn_id: ConnId) -> Result<PeerHandle, SignalError> {
        self.lock().route(role, conn_id)
    }

    /// See [`Session::snapshot`].
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }
}

/// Releases a connection's role slot when dropped, so a task that is
/// aborted mid-await still frees its role.
pub struct SlotGuard<'a> {
    registry: &'a Registry,
    role: Role,
    conn_id: ConnId,
}

impl<'a> SlotGuard<'a> {
    /// Arm a guard for a registration that has just succeeded.
    #[must_use]
    pub fn new(registry: &'a Registry, role: Role, conn_id: ConnId) -> Self {
        Self {
            registry,
            role,
            conn_id,
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.registry.release(self.role, self.conn_id) {
            tracing::info!(conn_id = self.conn_id, role = %self.role, "role slot released");
            crate::metrics::gauges::set_role_registered(self.role, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle(conn_id: ConnId) -> (PeerHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        (PeerHandle { tx, conn_id }, rx)
    }

    #[test]
    fn robot_first_then_client_notifies_robot_once() {
        let mut session = Session::default();
        let (robot, _robot_rx) = make_handle(1);
        let (client, _client_rx) = make_handle(2);

        let reg = session.register(Role::Robot, robot).unwrap();
        assert!(!reg.ready_to_self);
        assert!(reg.notify_robot.is_none());

        let reg = session.register(Role::Client, client).unwrap();
        assert!(!reg.ready_to_self);
        assert_eq!(reg.notify_robot.map(|h| h.conn_id), Some(1));
        assert!(!session.snapshot().waiting_for_robot);
    }

    #[test]
    fn client_first_sets_waiting_and_robot_gets_ready() {
        let mut session = Session::default();
        let (client, _client_rx) = make_handle(1);
        let (robot, _robot_rx) = make_handle(2);

        let reg = session.register(Role::Client, client).unwrap();
        assert!(reg.notify_robot.is_none());
        assert!(session.snapshot().waiting_for_robot);

        let reg = session.register(Role::Robot, robot).unwrap();
        assert!(reg.ready_to_self);
        assert!(!session.snapshot().waiting_for_robot);
    }

    #[test]
    fn second_robot_is_rejected_without_side_effects() {
        let mut session = Session::default();
        let (robot, _rx1) = make_handle(1);
        let (client, _rx2) = make_handle(2);
        let (intruder, _rx3) = make_handle(3);

        session.register(Role::Robot, robot).unwrap();
        session.register(Role::Client, client).unwrap();
        let before = session.snapshot();

        let err = session.register(Role::Robot, intruder).unwrap_err();
        assert!(matches!(err, SignalError::DuplicateRole));
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn client_reregistration_displaces_previous_client() {
        let mut session = Session::default();
        let (old, mut old_rx) = make_handle(1);
        let (new, _new_rx) = make_handle(2);

        session.register(Role::Client, old).unwrap();
        let reg = session.register(Role::Client, new).unwrap();
        let displaced = reg.displaced.unwrap();
        assert_eq!(displaced.conn_id, 1);

        drop(displaced);
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(session.snapshot().client, Some(2));
    }

    #[test]
    fn stale_release_keeps_newer_registration() {
        let mut session = Session::default();
        let (old, _rx1) = make_handle(1);
        let (new, _rx2) = make_handle(2);

        session.register(Role::Client, old).unwrap();
        session.register(Role::Client, new).unwrap();

        assert!(!session.release(Role::Client, 1));
        assert_eq!(session.snapshot().client, Some(2));
        assert!(session.release(Role::Client, 2));
        assert_eq!(session.snapshot().client, None);
    }

    #[test]
    fn client_leaving_clears_pending_ready() {
        let mut session = Session::default();
        let (client, _rx1) = make_handle(1);
        let (robot, _rx2) = make_handle(2);

        session.register(Role::Client, client).unwrap();
        session.release(Role::Client, 1);
        assert!(!session.snapshot().waiting_for_robot);

        let reg = session.register(Role::Robot, robot).unwrap();
        assert!(!reg.ready_to_self);
    }

    #[test]
    fn robot_reconnect_while_client_waits_gets_ready() {
        let mut session = Session::default();
        let (robot, _rx1) = make_handle(1);
        let (client, _rx2) = make_handle(2);
        let (robot2, _rx3) = make_handle(3);

        session.register(Role::Robot, robot).unwrap();
        session.register(Role::Client, client).unwrap();
        session.release(Role::Robot, 1);
        assert!(session.snapshot().waiting_for_robot);

        let reg = session.register(Role::Robot, robot2).unwrap();
        assert!(reg.ready_to_self);
    }

    #[test]
    fn route_resolves_opposite_role() {
        let mut session = Session::default();
        let (robot, _rx1) = make_handle(1);
        let (client, _rx2) = make_handle(2);

        session.register(Role::Robot, robot).unwrap();
        assert!(matches!(
            session.route(Role::Robot, 1),
            Err(SignalError::PeerUnavailable(Role::Client))
        ));

        session.register(Role::Client, client).unwrap();
        assert_eq!(session.route(Role::Robot, 1).unwrap().conn_id, 2);
        assert_eq!(session.route(Role::Client, 2).unwrap().conn_id, 1);
    }

    #[test]
    fn route_from_displaced_connection_fails() {
        let mut session = Session::default();
        let (robot, _rx1) = make_handle(1);
        let (old, _rx2) = make_handle(2);
        let (new, _rx3) = make_handle(3);

        session.register(Role::Robot, robot).unwrap();
        session.register(Role::Client, old).unwrap();
        session.register(Role::Client, new).unwrap();

        assert!(matches!(
            session.route(Role::Client, 2),
            Err(SignalError::Displaced(Role::Client))
        ));
    }

    #[test]
    fn registry_allocates_distinct_ids() {
        let registry = Registry::new();
        let a = registry.next_conn_id();
        let b = registry.next_conn_id();
        assert_ne!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let registry = Registry::new();
        let (robot, _rx) = make_handle(7);
        registry.register(Role::Robot, robot).unwrap();

        {
            let _guard = SlotGuard::new(&registry, Role::Robot, 7);
            assert_eq!(registry.snapshot().robot, Some(7));
        }

        assert_eq!(registry.snapshot().robot, None);
    }

    #[test]
    fn second_robot_rejected_exactly_when_slot_taken() {
        let registry = Registry::new();
        let mut receivers = Vec::new();
        for step in 0..40u64 {
            let id = registry.next_conn_id();
            let (handle, rx) = make_handle(id);
            receivers.push(rx);
            let role = if step % 3 == 0 { Role::Client } else { Role::Robot };
            let before = registry.snapshot();
            let result = registry.register(role, handle);
            let after = registry.snapshot();
            match role {
                Role::Robot if before.robot.is_some() => {
                    assert!(matches!(result, Err(SignalError::DuplicateRole)));
                    assert_eq!(after, before);
                }
                _ => assert!(result.is_ok()),
            }
            if step % 5 == 4 {
                if let Some(robot) = after.robot {
                    assert!(registry.release(Role::Robot, robot));
                }
            }
            let snap = registry.snapshot();
            assert!(!(snap.waiting_for_robot && snap.robot.is_some()));
            assert_eq!(snap.waiting_for_robot, snap.client.is_some() && snap.robot.is_none());
        }
    }
}
