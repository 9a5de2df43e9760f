use dbatlas_core::{ConnectionParams, DbError, Dialect};
use std::future::Future;
use std::time::{Duration, Instant};
use testcontainers::GenericImage;
use testcontainers::clients::Cli;
use testcontainers::core::WaitFor;

pub async fn with_postgres_params<T, F, Fut>(run: F) -> T
where
    F: FnOnce(ConnectionParams) -> Fut,
    Fut: Future<Output = T>,
{
    let docker = Cli::default();
    let image = GenericImage::new("postgres", "16")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        .with_exposed_port(5432)
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = docker.run(image);
    let port = container.get_host_port_ipv4(5432);
    let params = ConnectionParams::new(Dialect::Postgres, "127.0.0.1", "postgres", "postgres")
        .with_port(port)
        .with_password("postgres");

    run(params).await
}

pub async fn with_mysql_params<T, F, Fut>(run: F) -> T
where
    F: FnOnce(ConnectionParams) -> Fut,
    Fut: Future<Output = T>,
{
    let docker = Cli::default();
    let image = GenericImage::new("mysql", "8.4")
        .with_env_var("MYSQL_ROOT_PASSWORD", "root")
        .with_env_var("MYSQL_DATABASE", "testdb")
        .with_exposed_port(3306)
        .with_wait_for(WaitFor::message_on_stderr("ready for connections"));

    let container = docker.run(image);
    let port = container.get_host_port_ipv4(3306);
    let params = ConnectionParams::new(Dialect::Mysql, "127.0.0.1", "root", "testdb")
        .with_port(port)
        .with_password("root");

    run(params).await
}

pub async fn with_oracle_params<T, F, Fut>(run: F) -> T
where
    F: FnOnce(ConnectionParams) -> Fut,
    Fut: Future<Output = T>,
{
    let docker = Cli::default();
    let image = GenericImage::new("gvenzl/oracle-free", "23-slim")
        .with_env_var("ORACLE_PASSWORD", "oracle")
        .with_env_var("APP_USER", "atlas")
        .with_env_var("APP_USER_PASSWORD", "atlas")
        .with_exposed_port(1521)
        .with_wait_for(WaitFor::message_on_stdout("DATABASE IS READY TO USE!"));

    let container = docker.run(image);
    let port = container.get_host_port_ipv4(1521);
    let params = ConnectionParams::new(Dialect::Oracle, "127.0.0.1", "atlas", "")
        .with_service_name("FREEPDB1")
        .with_port(port)
        .with_password("atlas");

    run(params).await
}

/// Retries `operation` until it succeeds or `timeout` passes. Containers
/// often log readiness before they accept logins.
pub async fn retry_db_operation<T, F, Fut>(timeout: Duration, mut operation: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(error);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
