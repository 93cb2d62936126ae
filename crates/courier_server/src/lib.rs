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

//! A real-time direct-messaging relay with durable store-and-forward.
//!
//! Clients hold long-lived WebSocket sessions; direct messages are
//! persisted before they are relayed, so offline recipients catch up over
//! the sync endpoints on reconnect; read and delivery receipts flow back
//! to senders both durably and live.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use core::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use utoipa::OpenApi;

use courier_core::messaging::{MessageStore, SessionVerifier, UserResolver};
use courier_core::settings::Settings;

#[macro_use]
pub mod misc;

pub mod auth;
pub mod cli;
pub mod error;
pub mod graceful_shutdown;
pub mod hub;
pub mod ratelimit;
pub mod relay;
pub mod repository;
pub mod request_id;
pub mod session;
pub mod sync;

use auth::{SqlUserResolver, StaticTokenVerifier};
use hub::Hub;
use ratelimit::{FixedWindowLimiter, RateLimiter, SharedWindowLimiter};
use relay::DurableRelay;
use repository::SqliteMessageStore;

/// Environment variable with `token:user_id:username` entries for the
/// stand-in session verifier. Deployments that front a real identity
/// service wire their own [`SessionVerifier`] through [`run_server_with`]
/// instead.
pub const ENV_SESSION_TOKENS: &str = "COURIER_SESSION_TOKENS";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Courier API",
        description = "Real-time direct messaging with durable store-and-forward.",
    ),
    paths(
        misc::version,
        misc::health,
        session::ws_handshake,
        sync::get_inbox,
        sync::get_outbox,
        sync::mark_delivered,
        sync::mark_read,
    ),
    components(schemas(
        misc::Version,
        sync::ReceiptRequest,
        courier_core::envelope::Envelope,
        courier_core::envelope::EnvelopeKind,
        courier_core::messaging::StoredMessage,
        courier_core::messaging::DeliveryFailure,
    ))
)]
struct ApiDoc;

/// Result for main functions.
pub type CourierResult = Result<(), String>;

/// Everything the HTTP and session layers share, assembled once at
/// startup.
#[derive(Clone)]
pub struct AppState {
    /// The live session registry.
    pub hub: Arc<Hub>,
    /// The durable message store.
    pub store: Arc<dyn MessageStore>,
    /// The persist-then-deliver service.
    pub relay: Arc<DurableRelay>,
    /// The injected identity verifier.
    pub verifier: Arc<dyn SessionVerifier>,
    /// The injected username resolver.
    pub resolver: Arc<dyn UserResolver>,
    /// Process configuration.
    pub settings: Arc<Settings>,
    /// The backing pool, for health probes and the shared rate limiter.
    pub pool: SqlitePool,
}

impl AppState {
    /// Compose the hub, store, and relay over an open pool and the
    /// injected collaborators.
    pub fn assemble(
        pool: SqlitePool,
        verifier: Arc<dyn SessionVerifier>,
        resolver: Arc<dyn UserResolver>,
        settings: Settings,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(pool.clone()));
        let relay = Arc::new(DurableRelay::new(store.clone(), hub.clone()));
        Self {
            hub,
            store,
            relay,
            verifier,
            resolver,
            settings: Arc::new(settings),
            pool,
        }
    }
}

/// Build the full route tree over the given state.
pub fn router(state: AppState) -> Router {
    let limit = state.settings.ws_handshake_rate_limit_per_minute;
    let handshake_limiter: Arc<dyn RateLimiter> = if state.settings.shared_rate_limit {
        Arc::new(SharedWindowLimiter::new(
            state.pool.clone(),
            limit,
            ratelimit::WINDOW,
        ))
    } else {
        Arc::new(FixedWindowLimiter::new(limit, ratelimit::WINDOW))
    };

    // The limiter is outermost on the handshake: unauthenticated attempts
    // count too.
    let session_routes = Router::new()
        .route("/ws", get(session::ws_handshake))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::handshake_guard,
        ))
        .route_layer(middleware::from_fn_with_state(
            handshake_limiter,
            ratelimit::rate_limit_middleware,
        ));

    let sync_routes = Router::new()
        .route("/api/messages/inbox", get(sync::get_inbox))
        .route("/api/messages/outbox", get(sync::get_outbox))
        .route("/api/messages/delivered", post(sync::mark_delivered))
        .route("/api/messages/read", post(sync::mark_read))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(session_routes)
        .merge(sync_routes)
        .route("/v1/misc/version", get(misc::version))
        .route("/v1/misc/health", get(misc::health))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .with_state(state)
}

/// Main entry point for the relay process.
pub fn start(command: &cli::TopLevel) -> CourierResult {
    match &command.subcommand {
        None => serve(&cli::Serve::default()),
        Some(cli::Command::Serve(args)) => serve(args),
        Some(cli::Command::Version(_)) => version(),
        Some(cli::Command::Oasgen(args)) => oasgen(args),
    }
}

/// Prints the courier version to stdout.
pub fn version() -> CourierResult {
    println!(cargo_crate_version!());
    Ok(())
}

/// Generates the OpenAPI spec.
pub fn oasgen(args: &cli::Oasgen) -> CourierResult {
    let doc = ApiDoc::openapi();
    let rendered = if args.json {
        doc.to_pretty_json().map_err(|err| err.to_string())?
    } else {
        doc.to_yaml().map_err(|err| err.to_string())?
    };
    println!("{rendered}");

    Ok(())
}

fn serve(args: &cli::Serve) -> CourierResult {
    start_server(args)
}

#[tokio::main]
async fn start_server(args: &cli::Serve) -> CourierResult {
    init_tracing();

    let mut settings = Settings::from_env();
    if let Some(bind) = &args.bind {
        settings.bind_addr = bind.clone();
    }
    if let Some(database) = &args.database {
        settings.database_url = database.clone();
    }

    run_server(settings).await
}

/// Run the relay with the stand-in static-token verifier configured from
/// [`ENV_SESSION_TOKENS`].
pub async fn run_server(settings: Settings) -> CourierResult {
    let tokens = std::env::var(ENV_SESSION_TOKENS).unwrap_or_default();
    let verifier: Arc<dyn SessionVerifier> = Arc::new(StaticTokenVerifier::from_spec(&tokens));
    run_server_with(settings, verifier).await
}

/// Run the relay with an injected identity verifier.
pub async fn run_server_with(
    settings: Settings,
    verifier: Arc<dyn SessionVerifier>,
) -> CourierResult {
    let pool = repository::connect(&settings.database_url)
        .await
        .map_err(|err| format!("cannot open database {}: {err}", settings.database_url))?;
    let resolver = Arc::new(SqlUserResolver::new(pool.clone()));

    let state = AppState::assemble(pool, verifier, resolver, settings.clone());
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|err| format!("cannot bind {}: {err}", settings.bind_addr))?;
    info!("Listening on {}", settings.bind_addr);

    // Hard-termination watchdog for sessions that refuse to die.
    tokio::spawn(async {
        graceful_shutdown::global_shutdown_ends().await;
        error!("Shutdown grace period has ended; exiting abnormally");
        std::process::exit(1);
    });

    let serving = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    tokio::select! {
        served = serving.into_future() => {
            served.map_err(|err| err.to_string())?;
        }
        _ = graceful_shutdown::global_shutdown_starts() => {
            info!("Shutting down, closing live sessions");
            state.hub.shutdown().await;
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
