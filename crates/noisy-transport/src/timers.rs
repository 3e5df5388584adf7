//! Per-peer protocol timers.
//!
//! Each peer runs one timer task. The five timers are deadlines in a small
//! table; modifying one wakes the task so it can re-arm its sleep. Hooks
//! below are called from the data and handshake paths at the points where
//! the protocol says a timer should be armed or cancelled.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use noisy_core::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
    REKEY_TIMEOUT_JITTER_MAX,
};
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::peer::Peer;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    RetransmitHandshake,
    SendKeepalive,
    NewHandshake,
    ZeroKeyMaterial,
    PersistentKeepalive,
}

const TIMERS: [Timer; 5] = [
    Timer::RetransmitHandshake,
    Timer::SendKeepalive,
    Timer::NewHandshake,
    Timer::ZeroKeyMaterial,
    Timer::PersistentKeepalive,
];

pub(crate) struct Timers {
    deadlines: Mutex<[Option<Instant>; 5]>,
    changed: Notify,
    pub handshake_attempts: AtomicU32,
    pub need_another_keepalive: AtomicBool,
    pub sent_last_minute_handshake: AtomicBool,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            deadlines: Mutex::new([None; 5]),
            changed: Notify::new(),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
            sent_last_minute_handshake: AtomicBool::new(false),
        }
    }

    pub fn mod_timer(&self, timer: Timer, after: Duration) {
        sync::lock(&self.deadlines)[timer as usize] = Some(Instant::now() + after);
        self.changed.notify_one();
    }

    pub fn del(&self, timer: Timer) {
        sync::lock(&self.deadlines)[timer as usize] = None;
    }

    pub fn is_pending(&self, timer: Timer) -> bool {
        sync::lock(&self.deadlines)[timer as usize].is_some()
    }

    /// Cancel everything and reset the counters.
    pub fn reset(&self) {
        *sync::lock(&self.deadlines) = [None; 5];
        self.handshake_attempts.store(0, Ordering::Release);
        self.need_another_keepalive.store(false, Ordering::Release);
        self.sent_last_minute_handshake.store(false, Ordering::Release);
    }

    fn next_deadline(&self) -> Option<Instant> {
        sync::lock(&self.deadlines).iter().flatten().min().copied()
    }

    fn take_expired(&self, now: Instant) -> Vec<Timer> {
        let mut deadlines = sync::lock(&self.deadlines);
        TIMERS
            .into_iter()
            .filter(|timer| {
                let slot = &mut deadlines[*timer as usize];
                let expired = matches!(slot, Some(deadline) if *deadline <= now);
                if expired {
                    *slot = None;
                }
                expired
            })
            .collect()
    }
}

fn jitter() -> Duration {
    let max = REKEY_TIMEOUT_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

/// Timer task of one peer. Runs until aborted by `Peer::stop`.
pub(crate) async fn run(peer: Arc<Peer>) {
    loop {
        let notified = peer.timers.changed.notified();
        match peer.timers.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = notified => continue,
                }
            }
            None => {
                notified.await;
                continue;
            }
        }
        for timer in peer.timers.take_expired(Instant::now()) {
            match timer {
                Timer::RetransmitHandshake => peer.expired_retransmit_handshake().await,
                Timer::SendKeepalive => peer.expired_send_keepalive().await,
                Timer::NewHandshake => peer.expired_new_handshake().await,
                Timer::ZeroKeyMaterial => peer.expired_zero_key_material(),
                Timer::PersistentKeepalive => peer.expired_persistent_keepalive().await,
            }
        }
    }
}

impl Peer {
    fn timers_active(&self) -> bool {
        self.is_running() && self.transport().is_some_and(|t| t.is_up())
    }

    async fn expired_retransmit_handshake(&self) {
        let attempts = self.timers.handshake_attempts.load(Ordering::Acquire);
        if attempts > MAX_TIMER_HANDSHAKES {
            debug!(
                "{} - Handshake did not complete after {} attempts, giving up",
                self,
                MAX_TIMER_HANDSHAKES + 2
            );
            if self.timers_active() {
                self.timers.del(Timer::SendKeepalive);
            }
            self.flush_staged_packets();
            // Drop keys if nothing new arrives in the meantime.
            if self.timers_active() && !self.timers.is_pending(Timer::ZeroKeyMaterial) {
                self.timers
                    .mod_timer(Timer::ZeroKeyMaterial, REJECT_AFTER_TIME * 3);
            }
            return;
        }
        self.timers.handshake_attempts.fetch_add(1, Ordering::AcqRel);
        debug!(
            "{} - Handshake did not complete after {} seconds, retrying (try {})",
            self,
            REKEY_TIMEOUT.as_secs(),
            attempts + 2
        );
        self.send_handshake_initiation(true).await;
    }

    async fn expired_send_keepalive(&self) {
        self.send_keepalive().await;
        if self.timers.need_another_keepalive.swap(false, Ordering::AcqRel)
            && self.timers_active()
        {
            self.timers.mod_timer(Timer::SendKeepalive, KEEPALIVE_TIMEOUT);
        }
    }

    async fn expired_new_handshake(&self) {
        debug!(
            "{} - Retrying handshake because we stopped hearing back after {} seconds",
            self,
            (KEEPALIVE_TIMEOUT + REKEY_TIMEOUT).as_secs()
        );
        self.send_handshake_initiation(false).await;
    }

    fn expired_zero_key_material(&self) {
        debug!(
            "{} - Removing all keys, since we haven't received a new one in {} seconds",
            self,
            (REJECT_AFTER_TIME * 3).as_secs()
        );
        self.zero_and_flush_all();
    }

    async fn expired_persistent_keepalive(&self) {
        if !self.persistent_keepalive().is_zero() {
            self.send_keepalive().await;
        }
    }

    /// Outbound data went out: expect to hear back before too long.
    pub(crate) fn timers_data_sent(&self) {
        if self.timers_active() && !self.timers.is_pending(Timer::NewHandshake) {
            self.timers
                .mod_timer(Timer::NewHandshake, KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + jitter());
        }
    }

    /// Inbound data arrived: answer with a keepalive if we send nothing else.
    pub(crate) fn timers_data_received(&self) {
        if !self.timers_active() {
            return;
        }
        if !self.timers.is_pending(Timer::SendKeepalive) {
            self.timers.mod_timer(Timer::SendKeepalive, KEEPALIVE_TIMEOUT);
        } else {
            self.timers
                .need_another_keepalive
                .store(true, Ordering::Release);
        }
    }

    pub(crate) fn timers_any_authenticated_packet_sent(&self) {
        if self.timers_active() {
            self.timers.del(Timer::SendKeepalive);
        }
    }

    pub(crate) fn timers_any_authenticated_packet_received(&self) {
        if self.timers_active() {
            self.timers.del(Timer::NewHandshake);
        }
    }

    pub(crate) fn timers_handshake_initiated(&self) {
        if self.timers_active() {
            self.timers
                .mod_timer(Timer::RetransmitHandshake, REKEY_TIMEOUT + jitter());
        }
    }

    pub(crate) fn timers_handshake_complete(&self) {
        if self.timers_active() {
            self.timers.del(Timer::RetransmitHandshake);
        }
        self.timers.handshake_attempts.store(0, Ordering::Release);
        self.timers
            .sent_last_minute_handshake
            .store(false, Ordering::Release);
        self.set_last_handshake(SystemTime::now());
    }

    pub(crate) fn timers_session_derived(&self) {
        if self.timers_active() {
            self.timers
                .mod_timer(Timer::ZeroKeyMaterial, REJECT_AFTER_TIME * 3);
        }
    }

    /// Any authenticated packet in either direction.
    pub(crate) fn timers_any_authenticated_packet_traversal(&self) {
        let keepalive = self.persistent_keepalive();
        if !keepalive.is_zero() && self.timers_active() {
            self.timers.mod_timer(Timer::PersistentKeepalive, keepalive);
        }
    }
}
