use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use strata_types::DatabaseId;
use tracing::{error, info};

use crate::backend::{Connection, Connector};
use crate::pool::{ConnectionPool, PoolStatus, PooledConnection};
use crate::{PoolConfig, PoolError};

/// Owns one [`ConnectionPool`] per physical database. Database ids are the
/// registration order, starting at zero.
#[derive(Default)]
pub struct ConnectionRegistry {
    pools: Vec<Arc<ConnectionPool>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the next database and return its id.
    pub fn add_database(
        &mut self,
        name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> DatabaseId {
        let id = self.pools.len() as DatabaseId;
        let name = name.into();
        info!(database = %name, database_id = id, max_active = config.max_active, "registered connection pool");
        self.pools.push(ConnectionPool::new(id, name, config, connector));
        id
    }

    pub fn database_count(&self) -> usize {
        self.pools.len()
    }

    pub fn database_name(&self, id: DatabaseId) -> Option<&str> {
        self.pool(id).map(|p| p.name())
    }

    pub fn pool(&self, id: DatabaseId) -> Option<&Arc<ConnectionPool>> {
        self.pools.get(id as usize)
    }

    /// Check out a connection to database `id`.
    pub async fn acquire(&self, id: DatabaseId) -> Result<PooledConnection, PoolError> {
        let pool = self.pool(id).ok_or(PoolError::UnknownDatabase(id))?;
        pool.acquire().await
    }

    /// Give a connection back. Dropping the handle does the same.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.pools.iter().map(|p| p.status()).collect()
    }

    /// Ping every database once. Returns the databases that failed.
    pub async fn ping_all(&self) -> Vec<(DatabaseId, String)> {
        let mut failed = Vec::new();
        for pool in &self.pools {
            let outcome = match pool.acquire().await {
                Ok(mut conn) => conn.ping().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = outcome {
                failed.push((pool.database_id(), reason));
            }
        }
        failed
    }

    /// Close every pool. Outstanding handles stay valid until dropped.
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.close();
        }
        info!(pools = self.pools.len(), "connection registry shut down");
    }

    /// Serve `GET /readyz` with the pool snapshot as JSON. Answers 503 once
    /// any pool is closed. Returns the bound address.
    pub fn start_readyz(self: &Arc<Self>, listen: SocketAddr) -> Result<SocketAddr, hyper::Error> {
        let registry = Arc::clone(self);
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| readyz(req, registry.clone()))) }
        });
        let server = Server::try_bind(&listen)?.serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("readyz server error: {e}");
            }
        });
        info!(%addr, "readiness probe listening");
        Ok(addr)
    }
}

async fn readyz(req: Request<Body>, registry: Arc<ConnectionRegistry>) -> Result<Response<Body>, Infallible> {
    if req.uri().path() != "/readyz" {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }
    let status = registry.status();
    let ready = status.iter().all(|p| !p.closed);
    let body = serde_json::to_vec(&status).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatabase;

    fn registry(dbs: &[&MemoryDatabase]) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        for db in dbs {
            registry.add_database(db.name(), PoolConfig::default(), Arc::new((*db).clone()));
        }
        registry
    }

    #[tokio::test]
    async fn acquires_by_dense_database_id() {
        let ds0 = MemoryDatabase::new("ds0");
        let ds1 = MemoryDatabase::new("ds1");
        let registry = registry(&[&ds0, &ds1]);
        let conn = registry.acquire(1).await.unwrap();
        assert_eq!(conn.database_name(), "ds1");
        registry.release(conn);
        assert!(matches!(registry.acquire(2).await.unwrap_err(), PoolError::UnknownDatabase(2)));
    }

    #[tokio::test]
    async fn ping_all_reports_unreachable_databases() {
        let ds0 = MemoryDatabase::new("ds0");
        let ds1 = MemoryDatabase::new("ds1");
        ds1.set_reachable(false);
        let registry = registry(&[&ds0, &ds1]);
        let failed = registry.ping_all().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 1);
    }

    #[tokio::test]
    async fn readyz_serves_pool_status() {
        let ds0 = MemoryDatabase::new("ds0");
        let registry = Arc::new(registry(&[&ds0]));
        let addr = registry.start_readyz("127.0.0.1:0".parse().unwrap()).unwrap();
        let uri: hyper::Uri = format!("http://{addr}/readyz").parse().unwrap();
        let resp = hyper::Client::new().get(uri.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed[0]["database"], "ds0");

        registry.shutdown();
        let resp = hyper::Client::new().get(uri).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
