/* Copyright 2026- The Courier team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Process shutdown without dropping live sessions on the floor.
//!
//! Shutdown happens in two phases: when the signal arrives, the listener
//! stops accepting and the hub closes every session; if the process is
//! still around when the grace period lapses, it is terminated hard.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::signal;
use tokio::sync::OnceCell;
use tracing::warn;

/// The duration between [`global_shutdown_starts`] and
/// [`global_shutdown_ends`].
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

static SHUTDOWN_INVOKED_AT: OnceCell<OffsetDateTime> = OnceCell::const_new();

/// Wait for a shutdown signal: `CTRL+C` everywhere, plus `SIGTERM` on
/// unix, which is what a supervisor sends first.
async fn signal_listener() -> OffsetDateTime {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = wait_for_ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    let invoked_at = OffsetDateTime::now_utc();
    warn!(
        "Shutdown invoked at {invoked_at}; hard termination at {}",
        invoked_at + SHUTDOWN_GRACE_PERIOD
    );
    invoked_at
}

async fn wait_for_ctrl_c() {
    while signal::ctrl_c().await.is_err() { /* spin */ }
}

/// Resolves when a global shutdown has started. All tasks **should** start
/// gracefully exiting by this time.
pub async fn global_shutdown_starts() {
    let invoked_at = *SHUTDOWN_INVOKED_AT.get_or_init(signal_listener).await;
    yield_until(invoked_at).await;
}

/// Resolves when the grace period following [`global_shutdown_starts`] has
/// lapsed and the process is about to terminate unconditionally.
pub async fn global_shutdown_ends() {
    let invoked_at = *SHUTDOWN_INVOKED_AT.get_or_init(signal_listener).await;
    yield_until(invoked_at + SHUTDOWN_GRACE_PERIOD).await;
}

/// Yields until the given UTC instant has passed.
pub async fn yield_until(t: OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    if t > now {
        tokio::time::sleep((t - now).unsigned_abs()).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn yield_until_a_past_instant_returns_immediately() {
        let started = std::time::Instant::now();
        yield_until(OffsetDateTime::now_utc() - time::Duration::seconds(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
