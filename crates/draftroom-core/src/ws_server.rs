// WebSocket listener for draft-room clients.
//
// Clients connect to `/ws/draft/<league>?userID=<user>`. The target is
// validated during the handshake, so a bad route never gets upgraded.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::connection::{join_room, ConnectionSettings};
use crate::hub::HubHandle;
use crate::protocol::{LeagueId, UserId};

const ROUTE_PREFIX: &str = "/ws/draft/";
const USER_PARAM: &str = "userID";

/// Why an upgrade request was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinRequestError {
    #[error("no draft room at {0}")]
    UnknownPath(String),

    #[error("invalid league id '{0}'")]
    InvalidLeague(String),

    #[error("missing `userID` query parameter")]
    MissingUser,

    #[error("invalid userID '{0}'")]
    InvalidUser(String),
}

impl JoinRequestError {
    /// HTTP status sent back instead of the upgrade.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownPath(_) | Self::InvalidLeague(_) => StatusCode::NOT_FOUND,
            Self::MissingUser | Self::InvalidUser(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Extract the league and user from an upgrade request target.
pub fn parse_join_target(
    path: &str,
    query: Option<&str>,
) -> Result<(LeagueId, UserId), JoinRequestError> {
    let segment = path
        .strip_prefix(ROUTE_PREFIX)
        .filter(|s| !s.is_empty() && !s.contains('/'))
        .ok_or_else(|| JoinRequestError::UnknownPath(path.to_string()))?;

    let league = segment
        .parse::<i64>()
        .ok()
        .and_then(LeagueId::new)
        .ok_or_else(|| JoinRequestError::InvalidLeague(segment.to_string()))?;

    let raw_user = query
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| match pair.split_once('=') {
            Some((USER_PARAM, value)) => Some(value),
            _ => None,
        })
        .ok_or(JoinRequestError::MissingUser)?;

    let user = raw_user
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| JoinRequestError::InvalidUser(raw_user.to_string()))?;

    Ok((league, user))
}

/// Accept connections on `listener` forever, serving each one on its own
/// task.
///
/// Accept failures are logged and retried; only a listener without a local
/// address is fatal.
pub async fn run(
    listener: TcpListener,
    hub: HubHandle,
    settings: ConnectionSettings,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("Draft room server listening on ws://{local_addr}{ROUTE_PREFIX}<league>");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("Accepted TCP connection from {addr}");

        let hub = hub.clone();
        let settings = settings.clone();
        tokio::spawn(serve(stream, addr, hub, settings));
    }
}

async fn serve(stream: TcpStream, addr: SocketAddr, hub: HubHandle, settings: ConnectionSettings) {
    let mut target = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match parse_join_target(request.uri().path(), request.uri().query()) {
            Ok(parsed) => {
                target = Some(parsed);
                Ok(response)
            }
            Err(e) => {
                warn!("Rejecting upgrade from {addr}: {e}");
                Err(error_response(&e))
            }
        }
    };

    let config = settings.websocket_config();
    let ws = match accept_hdr_async_with_config(stream, callback, Some(config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };
    let Some((league, user)) = target else {
        return;
    };

    info!("User {user} connected to league {league} from {addr}");
    if let Err(e) = join_room(ws, league, user, hub, settings).await {
        warn!("Could not join {addr} to league {league}: {e}");
    }
}

fn error_response(err: &JoinRequestError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = err.status();
    response
}
