//! Resettable one-shot / repeating timer backed by a tokio task.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerControl {
    Armed {
        deadline: Instant,
        delay: Duration,
        repeat: bool,
    },
    Idle,
    Cancelled,
}

/// Timer whose firing callback runs on its own task.
///
/// The delay can be changed and the countdown restarted while it runs.
/// Dropping the handle stops the timer as well as [`Timer::cancel`].
#[derive(Debug)]
pub struct Timer {
    control: Arc<watch::Sender<TimerControl>>,
    task: JoinHandle<()>,
}

impl Timer {
    pub fn start<F>(delay: Duration, repeat: bool, mut on_fire: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (control, mut rx) = watch::channel(TimerControl::Armed {
            deadline: Instant::now() + delay,
            delay,
            repeat,
        });
        let control = Arc::new(control);
        let shared = control.clone();

        let task = tokio::spawn(async move {
            let mut current = *rx.borrow_and_update();
            loop {
                match current {
                    TimerControl::Cancelled => return,
                    TimerControl::Idle => {
                        if rx.changed().await.is_err() {
                            return;
                        }
                        current = *rx.borrow_and_update();
                    }
                    TimerControl::Armed {
                        deadline,
                        delay,
                        repeat,
                    } => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {
                                on_fire();
                                let next = if repeat {
                                    TimerControl::Armed { deadline: Instant::now() + delay, delay, repeat }
                                } else {
                                    TimerControl::Idle
                                };
                                // A reset issued by `on_fire` wins over the re-arm.
                                shared.send_if_modified(|control| {
                                    if *control == current {
                                        *control = next;
                                        true
                                    } else {
                                        false
                                    }
                                });
                                current = *rx.borrow_and_update();
                            }
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                current = *rx.borrow_and_update();
                            }
                        }
                    }
                }
            }
        });

        Self { control, task }
    }

    /// Restarts the countdown with the current delay.
    pub fn reset(&self) {
        self.control.send_modify(|control| {
            if let TimerControl::Armed {
                deadline,
                delay,
                ..
            } = control
            {
                *deadline = Instant::now() + *delay;
            }
        });
    }

    /// Arms the timer again after a `stop` or after a one-shot has fired.
    pub fn restart(&self, delay: Duration, repeat: bool) {
        self.control.send_if_modified(|control| {
            if *control == TimerControl::Cancelled {
                return false;
            }
            *control = TimerControl::Armed {
                deadline: Instant::now() + delay,
                delay,
                repeat,
            };
            true
        });
    }

    /// Changes the delay; a running countdown restarts from now.
    pub fn set_delay(&self, new_delay: Duration) {
        self.control.send_modify(|control| {
            if let TimerControl::Armed {
                deadline, delay, ..
            } = control
            {
                *delay = new_delay;
                *deadline = Instant::now() + new_delay;
            }
        });
    }

    /// Pauses the timer without tearing down its task.
    pub fn stop(&self) {
        self.control.send_if_modified(|control| {
            if *control == TimerControl::Cancelled {
                return false;
            }
            *control = TimerControl::Idle;
            true
        });
    }

    pub fn cancel(&self) {
        self.control.send_replace(TimerControl::Cancelled);
    }

    pub fn is_armed(&self) -> bool {
        matches!(*self.control.borrow(), TimerControl::Armed { .. }) && !self.task.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Timer started through [`crate::Channel::start_timer`]; firings are
/// delivered to `ChannelHandler::on_timer` with its id.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    timer: Timer,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, timer: Timer) -> Self {
        Self { id, timer }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn reset(&self) {
        self.timer.reset();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.timer.set_delay(delay);
    }

    pub fn stop(&self) {
        self.timer.stop();
    }

    pub fn restart(&self, delay: Duration, repeat: bool) {
        self.timer.restart(delay, repeat);
    }

    pub fn cancel(&self) {
        self.timer.cancel();
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::time::{advance, sleep};

    fn counting(delay: Duration, repeat: bool) -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::start(delay, repeat, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let (timer, fired) = counting(Duration::from_secs(5), false);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_firing() {
        let (timer, fired) = counting(Duration::from_secs(5), false);
        for _ in 0..4 {
            sleep(Duration::from_secs(4)).await;
            timer.reset();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_until_cancelled() {
        let (timer, fired) = counting(Duration::from_secs(1), true);
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        timer.cancel();
        advance(Duration::from_secs(10)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_can_be_restarted() {
        let (timer, fired) = counting(Duration::from_secs(2), false);
        timer.stop();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.restart(Duration::from_secs(1), false);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
