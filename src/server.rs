use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::config::ChainConfig;
use crate::error::Error;
use crate::model::{Chain, Transaction};
use crate::module::{AgglomeratorModule, Routing};
use crate::vector::LazyVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub from_chain: String,
    pub to_chain: String,
    #[serde(default)]
    pub payload: Option<String>,
    /// Explicit state vector; defaults to the source chain's vector.
    #[serde(default)]
    pub vector: Option<Vec<f64>>,
    /// Defaults to the node's configured threshold.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: String,
    pub route: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainView {
    pub id: String,
    pub protocol: String,
    pub endpoint: String,
    pub pending: usize,
}

impl From<&Chain> for ChainView {
    fn from(chain: &Chain) -> Self {
        Self {
            id: chain.id.clone(),
            protocol: chain.protocol.tag().to_string(),
            endpoint: chain.endpoint.clone(),
            pending: chain.transaction_pool().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::ChainNotFound(_) => StatusCode::NOT_FOUND,
        Error::NoRouteFound => StatusCode::UNPROCESSABLE_ENTITY,
        Error::ReplicationFailure(_) => StatusCode::BAD_GATEWAY,
        Error::NotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    let body = ErrorBody { error: err.to_string() };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn json_reply<T: Serialize>(result: crate::Result<T>, status: StatusCode) -> Response {
    match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), status).into_response(),
        Err(e) => error_reply(e),
    }
}

fn build_transaction(module: &AgglomeratorModule, req: TransactionRequest) -> crate::Result<Transaction> {
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if id.is_empty() {
        return Err(Error::InvalidInput("transaction id is empty".into()));
    }
    let threshold = req
    .similarity_threshold
    .unwrap_or(module.config().similarity_threshold);
    if !threshold.is_finite() {
        return Err(Error::InvalidInput("similarity_threshold must be finite".into()));
    }

    let vector = match req.vector {
        Some(elements) if elements.is_empty() => {
            return Err(Error::InvalidInput("vector is empty".into()));
        }
        Some(elements) => LazyVector::from_elements(elements),
        None => module.get_chain(&req.from_chain)?.state_vector,
    };

    Ok(Transaction::new(id, req.from_chain, req.to_chain, vector, threshold)
    .with_payload(req.payload.unwrap_or_default().into_bytes()))
}

/// All API routes over `module`.
pub fn routes(
    module: Arc<AgglomeratorModule>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    // POST /transaction
    let transaction = warp::post()
    .and(warp::path!("transaction"))
    .and(warp::body::json())
    .and(with_module(module.clone()))
    .and_then(|req: TransactionRequest, module: Arc<AgglomeratorModule>| async move {
        let routing = req.routing;
        let result = match build_transaction(&module, req) {
            Ok(tx) => module
            .process_transaction(&tx, routing)
            .await
            .map(|route| TransactionResponse { id: tx.id.clone(), route }),
            Err(e) => Err(e),
        };
        Ok::<_, warp::Rejection>(json_reply(result, StatusCode::OK))
    });

    // GET /chains
    let list_chains = warp::get()
    .and(warp::path!("chains"))
    .and(with_module(module.clone()))
    .map(|module: Arc<AgglomeratorModule>| {
        let chains: Vec<ChainView> = module.list_chains().iter().map(ChainView::from).collect();
        warp::reply::json(&chains).into_response()
    });

    // POST /chains
    let add_chain = warp::post()
    .and(warp::path!("chains"))
    .and(warp::body::json())
    .and(with_module(module.clone()))
    .and_then(|cfg: ChainConfig, module: Arc<AgglomeratorModule>| async move {
        let result = module.register_chain(&cfg).await.map(|chain| ChainView::from(&chain));
        Ok::<_, warp::Rejection>(json_reply(result, StatusCode::CREATED))
    });

    // GET /chains/{id}
    let get_chain = warp::get()
    .and(warp::path!("chains" / String))
    .and(with_module(module.clone()))
    .map(|id: String, module: Arc<AgglomeratorModule>| {
        json_reply(module.get_chain(&id).map(|chain| ChainView::from(&chain)), StatusCode::OK)
    });

    // GET /status
    let status = warp::get()
    .and(warp::path!("status"))
    .and(with_module(module.clone()))
    .map(|module: Arc<AgglomeratorModule>| warp::reply::json(&module.status()).into_response());

    // POST /pause, POST /resume
    let pause = warp::post()
    .and(warp::path!("pause"))
    .and(with_module(module.clone()))
    .map(|module: Arc<AgglomeratorModule>| {
        json_reply(module.pause().map(|_| module.status()), StatusCode::OK)
    });

    let resume = warp::post()
    .and(warp::path!("resume"))
    .and(with_module(module))
    .map(|module: Arc<AgglomeratorModule>| {
        json_reply(module.resume().map(|_| module.status()), StatusCode::OK)
    });

    transaction
    .or(list_chains)
    .unify()
    .or(add_chain)
    .unify()
    .or(get_chain)
    .unify()
    .or(status)
    .unify()
    .or(pause)
    .unify()
    .or(resume)
    .unify()
}

/// Serves the API on `port` until `shutdown` resolves.
pub async fn serve<S>(module: Arc<AgglomeratorModule>, port: u16, shutdown: S) -> crate::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let (bound, server) = warp::serve(routes(module))
    .try_bind_with_graceful_shutdown(addr, shutdown)
    .map_err(|e| Error::Config(format!("cannot bind api on {addr}: {e}")))?;
    info!(addr = %bound, "http api listening");
    server.await;
    Ok(())
}

fn with_module(
    module: Arc<AgglomeratorModule>,
) -> impl Filter<Extract = (Arc<AgglomeratorModule>,), Error = Infallible> + Clone {
    warp::any().map(move || module.clone())
}
