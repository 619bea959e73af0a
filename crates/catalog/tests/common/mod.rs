//! Common test utilities: a containerized PostgreSQL catalog.

use curio_catalog::{CatalogError, CatalogResult, CatalogStore};
use std::sync::Arc;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test
/// setup. Tests use this marker to decide whether to skip due to
/// unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A test catalog over a PostgreSQL testcontainer.
pub struct TestCatalog {
    pub store: Arc<CatalogStore>,
    _container: ContainerAsync<Postgres>,
}

impl TestCatalog {
    pub async fn new() -> CatalogResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                CatalogError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("failed to get port");

        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = CatalogStore::from_url(&url, 5).await?;

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<CatalogStore> {
        self.store.clone()
    }
}

/// Run a test against a containerized catalog, skipping when Docker is not
/// available (CI without a daemon, etc).
pub async fn run_catalog_test<F, Fut>(test_fn: F)
where
    F: FnOnce(Arc<CatalogStore>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match TestCatalog::new().await {
        Ok(catalog) => test_fn(catalog.store()).await,
        Err(e) if e.to_string().contains(POSTGRES_CONTAINER_START_ERR_PREFIX) => {
            eprintln!("skipping: Docker unavailable for PostgreSQL testcontainer: {e}");
        }
        Err(e) => panic!("failed to create test catalog: {e}"),
    }
}
