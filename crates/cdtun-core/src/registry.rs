//! Process-wide registry of active tunnels.
//!
//! The first registered tunnel installs shutdown hooks: interrupt and
//! terminate signals stop every active tunnel concurrently and exit 0; a
//! panic with tunnels still active runs the same shutdown and exits 1.
//! Hooks install at most once per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::tunnel::TunnelSession;

struct Registry {
    sessions: Mutex<HashMap<u64, Weak<TunnelSession>>>,
    next_token: AtomicU64,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HOOKS: OnceLock<()> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        sessions: Mutex::new(HashMap::new()),
        next_token: AtomicU64::new(1),
    })
}

/// Track a session for process-wide shutdown. Returns the token to pass
/// to [`unregister`].
pub fn register(session: &Arc<TunnelSession>) -> u64 {
    install_hooks();
    let reg = registry();
    let token = reg.next_token.fetch_add(1, Ordering::SeqCst);
    reg.sessions
        .lock()
        .expect("registry lock")
        .insert(token, Arc::downgrade(session));
    token
}

/// Remove a session from shutdown tracking.
pub fn unregister(token: u64) {
    registry()
        .sessions
        .lock()
        .expect("registry lock")
        .remove(&token);
}

/// Number of registered sessions still alive.
pub fn active_count() -> usize {
    let mut sessions = registry().sessions.lock().expect("registry lock");
    sessions.retain(|_, weak| weak.strong_count() > 0);
    sessions.len()
}

fn install_hooks() {
    HOOKS.get_or_init(|| {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime at first tunnel registration; shutdown hooks not installed");
            return;
        };

        handle.spawn(async {
            wait_for_signal().await;
            info!("shutdown signal received, stopping active tunnels");
            shutdown_all(0).await;
        });

        let previous = std::panic::take_hook();
        let panic_handle = handle.clone();
        std::panic::set_hook(Box::new(move |panic_info| {
            previous(panic_info);
            // Only commandeer process exit while tunnels are live.
            if active_count() > 0 {
                panic_handle.spawn(async {
                    shutdown_all(1).await;
                });
            }
        }));
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(%err, "SIGTERM handler unavailable, watching interrupt only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn shutdown_all(code: i32) {
    let sessions: Vec<Arc<TunnelSession>> = {
        let mut map = registry().sessions.lock().expect("registry lock");
        map.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
    };

    let mut stops = JoinSet::new();
    for session in sessions {
        stops.spawn(async move {
            session.close().await;
        });
    }
    while stops.join_next().await.is_some() {}

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv6Addr;

    use crate::error::{Error, Result};
    use crate::protocol::TunnelParameters;
    use crate::tunnel::TunDevice;

    struct NullTun;

    impl TunDevice for NullTun {
        fn read_packet(&self, _max_len: usize) -> Result<Vec<u8>> {
            Err(Error::AlreadyClosed)
        }
        fn write_packet(&self, _packet: &[u8]) -> Result<usize> {
            Err(Error::AlreadyClosed)
        }
        fn close(&self) {}
        fn is_closed(&self) -> bool {
            true
        }
        fn name(&self) -> String {
            "null0".into()
        }
        fn handle_id(&self) -> i64 {
            -1
        }
    }

    fn session() -> Arc<TunnelSession> {
        TunnelSession::from_device(
            Arc::new(NullTun),
            TunnelParameters {
                client_address: "fd00::2".parse::<Ipv6Addr>().unwrap(),
                mtu: 1500,
                server_address: "fd00::1".parse::<Ipv6Addr>().unwrap(),
                server_rsd_port: None,
            },
        )
    }

    // One combined test: the registry is process-global state, so the
    // assertions must not interleave across test threads.
    #[tokio::test]
    async fn register_prune_and_reinstall() {
        let s = session();
        let before = active_count();

        // Tokens are unique and hooks install only once.
        let t1 = register(&s);
        let t2 = register(&s);
        assert_ne!(t1, t2);
        assert_eq!(active_count(), before + 2);

        unregister(t1);
        assert_eq!(active_count(), before + 1);

        // A dropped session is pruned even before unregister.
        drop(s);
        assert_eq!(active_count(), before);
        unregister(t2);
    }
}
