//! SIGINT/SIGTERM handling.
//!
//! [`install`] registers one process-wide listener. Running code registers
//! [`InterruptHook`]s (the phased engine persists interrupted terminal state,
//! the supervisor loop drops its lease); on a signal the listener runs them
//! newest first with the signal's name and exits with
//! [`exit_codes::INTERRUPTED`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::exit_codes;

type Hook = Box<dyn FnOnce(&str) + Send>;

static HOOKS: HookRegistry = HookRegistry::new();

/// First-writer-wins slot for a run's terminal status.
///
/// The signal handler and normal completion race to claim it; only the winner
/// writes terminal metadata.
#[derive(Debug, Default)]
pub struct TerminalSlot(AtomicBool);

impl TerminalSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true for exactly one caller.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registered callbacks keyed by registration order.
struct HookRegistry {
    next_id: AtomicU64,
    hooks: Mutex<Vec<(u64, Hook)>>,
}

impl HookRegistry {
    const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, hook: Hook) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((id, hook));
        }
        id
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.retain(|(hook_id, _)| *hook_id != id);
        }
    }

    /// Take every hook and run it, newest first.
    fn fire(&self, signal: &str) {
        let hooks = self
            .hooks
            .lock()
            .map(|mut hooks| std::mem::take(&mut *hooks))
            .unwrap_or_default();
        for (_, hook) in hooks.into_iter().rev() {
            hook(signal);
        }
    }
}

fn on_signal(signal: &str) -> ! {
    HOOKS.fire(signal);
    std::process::exit(exit_codes::INTERRUPTED);
}

/// Name recorded in terminal reasons (`signal: interrupt`, `signal: terminated`).
#[cfg(unix)]
pub fn signal_name(signal: i32) -> &'static str {
    use signal_hook::consts::{SIGINT, SIGTERM};
    match signal {
        SIGINT => "interrupt",
        SIGTERM => "terminated",
        _ => "unknown",
    }
}

/// Install the process signal listener. Call once from `main`.
#[cfg(unix)]
pub fn install() -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("install signal handler")?;
    std::thread::Builder::new()
        .name("rpi-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                on_signal(signal_name(signal));
            }
        })
        .context("spawn signal listener")?;
    Ok(())
}

/// Install the process signal handler. Call once from `main`.
#[cfg(not(unix))]
pub fn install() -> Result<()> {
    ctrlc::set_handler(|| on_signal("interrupt")).context("install signal handler")
}

/// Registered interrupt callback; unregistered on drop.
pub struct InterruptHook {
    id: u64,
}

impl InterruptHook {
    /// Register `hook` to run with the signal name if the process is interrupted.
    pub fn register(hook: impl FnOnce(&str) + Send + 'static) -> Self {
        Self {
            id: HOOKS.register(Box::new(hook)),
        }
    }
}

impl Drop for InterruptHook {
    fn drop(&mut self) {
        HOOKS.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_slot_is_first_writer_wins() {
        let slot = TerminalSlot::new();
        let racers: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.claim())
            })
            .collect();
        let wins = racers
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(slot.is_claimed());
        assert!(!slot.claim());
    }

    /// Verifies hooks run newest first with the signal name, and that an
    /// unregistered hook does not run.
    #[test]
    fn hooks_fire_newest_first_with_signal_name() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["lease", "dropped", "phase"] {
            let seen = Arc::clone(&seen);
            let id = registry.register(Box::new(move |signal: &str| {
                seen.lock().expect("seen").push(format!("{label}:{signal}"));
            }));
            if label == "dropped" {
                registry.unregister(id);
            }
        }

        registry.fire("terminated");
        registry.fire("interrupt");

        assert_eq!(
            *seen.lock().expect("seen"),
            vec!["phase:terminated".to_string(), "lease:terminated".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn signal_names_match_terminal_reasons() {
        use signal_hook::consts::{SIGINT, SIGTERM};
        assert_eq!(signal_name(SIGINT), "interrupt");
        assert_eq!(signal_name(SIGTERM), "terminated");
    }
}
