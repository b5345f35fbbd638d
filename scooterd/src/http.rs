//! The SPA-facing HTTP surface.  Handlers translate domain verbs into commands, push them
//! through the replica facade on the blocking pool, and map the outcome onto status codes:
//! domain conflicts are 409, missing scooters 404, malformed input 400, quorum trouble 500.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};
use zerror_core::ErrorCore;

use scooter_pb::Error;

use crate::replica::Replica;

////////////////////////////////////////////// bodies //////////////////////////////////////////////

#[derive(Debug, Default, Deserialize)]
struct ReadQuery {
    #[serde(default)]
    linearizable: bool,
}

#[derive(Debug, Deserialize)]
struct ReservationBody {
    reservation_id: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    distance: f64,
}

////////////////////////////////////////////// routes //////////////////////////////////////////////

/// The full route table:  reads with an optional linearizability barrier, writes that ride
/// consensus, and the snapshot trigger.
pub fn routes(
    replica: Arc<Replica>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_replica = warp::any().map(move || Arc::clone(&replica));
    let list = warp::get()
        .and(warp::path("scooters"))
        .and(warp::path::end())
        .and(warp::query::<ReadQuery>())
        .and(with_replica.clone())
        .and_then(list_scooters);
    let get = warp::get()
        .and(warp::path("scooters"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::query::<ReadQuery>())
        .and(with_replica.clone())
        .and_then(get_scooter);
    let create = warp::put()
        .and(warp::path("scooters"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_replica.clone())
        .and_then(create_scooter);
    let reserve = warp::post()
        .and(warp::path("scooters"))
        .and(warp::path::param::<String>())
        .and(warp::path("reservations"))
        .and(warp::path::end())
        .and(warp::body::json::<ReservationBody>())
        .and(with_replica.clone())
        .and_then(reserve_scooter);
    let release = warp::post()
        .and(warp::path("scooters"))
        .and(warp::path::param::<String>())
        .and(warp::path("releases"))
        .and(warp::path::end())
        .and(warp::body::json::<ReleaseBody>())
        .and(with_replica.clone())
        .and_then(release_scooter);
    let snapshot = warp::post()
        .and(warp::path("snapshot"))
        .and(warp::path::end())
        .and(with_replica)
        .and_then(take_snapshot);
    list.or(get).or(create).or(reserve).or(release).or(snapshot)
}

/// Serve the routes until the process exits.
pub async fn serve(replica: Arc<Replica>, port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    warp::serve(routes(replica)).run(addr).await;
}

///////////////////////////////////////////// handlers /////////////////////////////////////////////

type HttpReply = warp::reply::WithStatus<warp::reply::Json>;

async fn list_scooters(query: ReadQuery, replica: Arc<Replica>) -> Result<HttpReply, Infallible> {
    let result = run_blocking(move || replica.scooters(query.linearizable)).await;
    Ok(match result {
        Ok(scooters) => ok_reply(&scooters),
        Err(err) => error_reply(err),
    })
}

async fn get_scooter(
    id: String,
    query: ReadQuery,
    replica: Arc<Replica>,
) -> Result<HttpReply, Infallible> {
    let result = {
        let id = id.clone();
        run_blocking(move || replica.scooter(&id, query.linearizable)).await
    };
    Ok(match result {
        Ok(Some(scooter)) => ok_reply(&scooter),
        Ok(None) => error_reply(Error::NotFound {
            core: ErrorCore::default(),
            id,
        }),
        Err(err) => error_reply(err),
    })
}

async fn create_scooter(id: String, replica: Arc<Replica>) -> Result<HttpReply, Infallible> {
    let result = run_blocking(move || replica.create(&id)).await;
    Ok(match result {
        Ok(scooter) => ok_reply(&scooter),
        Err(err) => error_reply(err),
    })
}

async fn reserve_scooter(
    id: String,
    body: ReservationBody,
    replica: Arc<Replica>,
) -> Result<HttpReply, Infallible> {
    let result = run_blocking(move || replica.reserve(&id, &body.reservation_id)).await;
    Ok(match result {
        Ok(scooter) => ok_reply(&scooter),
        Err(err) => error_reply(err),
    })
}

async fn release_scooter(
    id: String,
    body: ReleaseBody,
    replica: Arc<Replica>,
) -> Result<HttpReply, Infallible> {
    let result = run_blocking(move || replica.release(&id, body.distance)).await;
    Ok(match result {
        Ok(scooter) => ok_reply(&scooter),
        Err(err) => error_reply(err),
    })
}

async fn take_snapshot(replica: Arc<Replica>) -> Result<HttpReply, Infallible> {
    let result = run_blocking(move || replica.snapshot()).await;
    Ok(match result {
        Ok(snapshot_index) => ok_reply(&serde_json::json!({
            "snapshot_index": snapshot_index,
        })),
        Err(err) => error_reply(err),
    })
}

///////////////////////////////////////////// plumbing /////////////////////////////////////////////

async fn run_blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => Err(Error::LogicError {
            core: ErrorCore::default(),
            what: err.to_string(),
        }),
    }
}

fn ok_reply<T: serde::Serialize>(body: &T) -> HttpReply {
    warp::reply::with_status(warp::reply::json(body), StatusCode::OK)
}

fn error_reply(err: Error) -> HttpReply {
    let status = match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. } | Error::NotAvailable { .. } | Error::NotReserved { .. } => {
            StatusCode::CONFLICT
        }
        Error::InvalidDistance { .. } | Error::CodecError { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": err.to_string(),
    });
    warp::reply::with_status(warp::reply::json(&body), status)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
