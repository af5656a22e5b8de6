use crate::actor::ActorClient;
use crate::commitlog::Term;
use crate::replica::cluster_config::ServerId;
use crate::replica::timers::time::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// One tick of the leader's per-peer heartbeat timer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartbeatTick {
    pub peer_id: ServerId,
    pub term: Term,
}

/// Per-peer heartbeat timer held by the leader. The handle publishes the
/// next deadline on a watch channel; the background task sleeps toward it,
/// posts a tick when it passes, and self-schedules the following one.
/// The very first deadline is "now", so a fresh leader-follower pair makes
/// contact without waiting a full interval. Dropping the handle closes the
/// channel, which stops the task.
pub struct HeartbeatTimerHandle<C: Clock = RealClock> {
    deadline_tx: watch::Sender<Instant>,
    interval: Duration,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub fn spawn(interval: Duration, actor_client: ActorClient, peer_id: ServerId, term: Term) -> Self {
        Self::spawn_with_clock(interval, actor_client, peer_id, term, RealClock)
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    fn spawn_with_clock(
        interval: Duration,
        actor_client: ActorClient,
        peer_id: ServerId,
        term: Term,
        clock: C,
    ) -> Self {
        let (deadline_tx, deadline_rx) = watch::channel(clock.now());
        let tick = HeartbeatTick { peer_id, term };

        tokio::task::spawn(Self::timer_task(deadline_rx, interval, actor_client, tick, clock.clone()));

        HeartbeatTimerHandle {
            deadline_tx,
            interval,
            clock,
        }
    }

    /// Push the next periodic fire out by one interval; called after the
    /// leader proactively contacted this peer for other reasons.
    pub fn reset(&self) {
        // Err means the task is gone, which only happens at shutdown.
        let _ = self.deadline_tx.send(self.clock.now() + self.interval);
    }

    async fn timer_task(
        mut deadline_rx: watch::Receiver<Instant>,
        interval: Duration,
        actor_client: ActorClient,
        tick: HeartbeatTick,
        mut clock: C,
    ) {
        let mut next_fire = *deadline_rx.borrow_and_update();
        loop {
            tokio::select! {
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        // Handle dropped: this peer/term pairing is over.
                        return;
                    }
                    next_fire = *deadline_rx.borrow_and_update();
                }
                _ = clock.sleep_until(next_fire) => {
                    actor_client.heartbeat_tick(tick.clone()).await;
                    next_fire = clock.now() + interval;
                }
            }
        }
    }
}

/// Randomized election timer. One shot: a single ElectionTimeout fires
/// unless the deadline keeps getting pushed by leader contact. The owning
/// replica spawns a fresh handle whenever the timer must truly restart,
/// which also gives every restart fresh jitter.
pub struct ElectionTimerHandle {
    deadline_tx: watch::Sender<Instant>,
    timeout_range: RangeInclusive<Duration>,
}

impl ElectionTimerHandle {
    pub fn spawn(lower: Duration, upper: Duration, actor_client: ActorClient) -> Self {
        let timeout_range = RangeInclusive::new(lower, upper);
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + Self::jittered(&timeout_range));

        tokio::task::spawn(Self::timer_task(deadline_rx, actor_client));

        ElectionTimerHandle {
            deadline_tx,
            timeout_range,
        }
    }

    /// Called on any valid leader contact. A no-op once the timer has
    /// already fired; the replica restarts it from the timeout handler.
    pub fn reset(&self) {
        let _ = self.deadline_tx.send(Instant::now() + Self::jittered(&self.timeout_range));
    }

    fn jittered(range: &RangeInclusive<Duration>) -> Duration {
        rand::thread_rng().gen_range(range.clone())
    }

    async fn timer_task(mut deadline_rx: watch::Receiver<Instant>, actor_client: ActorClient) {
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        // Handle dropped; timer cancelled.
                        return;
                    }
                    // Deadline moved; go sleep toward the new one.
                }
                _ = tokio::time::sleep_until(deadline) => {
                    actor_client.election_timeout().await;
                    return;
                }
            }
        }
    }
}

/// Plain restartable stopwatch for grace-period and priority-change
/// bookkeeping. Owned and polled by the coordination task; no background
/// task involved.
#[derive(Debug)]
pub struct Stopwatch {
    started_at: Instant,
    duration: Duration,
}

impl Stopwatch {
    pub fn new(duration: Duration) -> Self {
        Stopwatch {
            started_at: Instant::now(),
            duration,
        }
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    pub fn reset(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn timed_out(&self) -> bool {
        self.elapsed() >= self.duration
    }
}

pub mod time {
    use tokio::time::Instant;

    #[async_trait::async_trait]
    pub trait Clock: Clone {
        fn now(&self) -> Instant;
        async fn sleep_until(&mut self, deadline: Instant);
    }

    #[derive(Copy, Clone)]
    pub struct RealClock;

    #[async_trait::async_trait]
    impl Clock for RealClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            tokio::time::sleep_until(deadline).await;
        }
    }

    #[cfg(test)]
    pub use manual::{manual_clock, ManualClock, ManualClockHandle};

}
