use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use claimd::engine::BackoffPolicy;
use claimd::tenant::TenantManager;
use claimd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("claimd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, BackoffPolicy::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "claimd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("claimd")
        .password("claimd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Rows of a simple query as (column -> text) lookups on one column.
async fn column(client: &Client, sql: &str, col: &str) -> Vec<Option<String>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row.get(col).map(str::to_string)),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(SqlState::code)
}

async fn create_resource(client: &Client, id: &str, capacity: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, capacity) VALUES ('{id}', {capacity})"
        ))
        .await
        .unwrap();
}

const RESERVE: &str = "INSERT INTO claims (resource_id, claimant_id) VALUES ($1, $2)";
const CANCEL: &str = "DELETE FROM claims WHERE resource_id = $1 AND claimant_id = $2";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_is_idempotent_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "idem").await;
    create_resource(&client, "room", 2).await;

    assert_eq!(client.execute(RESERVE, &[&"room", &"alice"]).await.unwrap(), 1);
    assert_eq!(client.execute(RESERVE, &[&"room", &"alice"]).await.unwrap(), 0);

    let claimants = column(
        &client,
        "SELECT * FROM claims WHERE resource_id = 'room'",
        "claimant_id",
    )
    .await;
    assert_eq!(claimants, vec![Some("alice".to_string())]);
}

#[tokio::test]
async fn full_resource_reports_sqlstate() {
    let addr = start_test_server().await;
    let client = connect(addr, "full").await;
    create_resource(&client, "desk", 1).await;

    client.execute(RESERVE, &[&"desk", &"alice"]).await.unwrap();
    let err = client
        .execute(RESERVE, &[&"desk", &"bob"])
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("53400"));

    assert_eq!(client.execute(CANCEL, &[&"desk", &"alice"]).await.unwrap(), 1);
    assert_eq!(client.execute(CANCEL, &[&"desk", &"alice"]).await.unwrap(), 0);
    assert_eq!(client.execute(RESERVE, &[&"desk", &"bob"]).await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_resource_and_bad_sql() {
    let addr = start_test_server().await;
    let client = connect(addr, "errors").await;

    let err = client
        .execute(RESERVE, &[&"nowhere", &"alice"])
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    let err = client.simple_query("UPDATE claims SET x = 1").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .batch_execute("INSERT INTO resources (id, capacity) VALUES ('r', 0)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn unsupported_filters_and_placeholders_are_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr, "strict").await;
    create_resource(&client, "room", 2).await;
    client.execute(RESERVE, &[&"room", &"alice"]).await.unwrap();

    let err = client
        .simple_query("SELECT * FROM claims WHERE resource_id = 'room' AND claimant_id = 'bob'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .prepare("SELECT * FROM claims WHERE resource_id = $99999999999")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    // The connection is still usable afterwards.
    assert_eq!(client.execute(RESERVE, &[&"room", &"bob"]).await.unwrap(), 1);
}

#[tokio::test]
async fn resources_listing_reflects_claims() {
    let addr = start_test_server().await;
    let client = connect(addr, "listing").await;
    client
        .batch_execute("INSERT INTO resources (id, capacity, name) VALUES ('hall', 3, 'Main hall')")
        .await
        .unwrap();
    client.execute(RESERVE, &[&"hall", &"a"]).await.unwrap();
    client.execute(RESERVE, &[&"hall", &"b"]).await.unwrap();

    let sql = "SELECT * FROM resources WHERE id = 'hall'";
    assert_eq!(column(&client, sql, "claimed").await, vec![Some("2".into())]);
    assert_eq!(column(&client, sql, "name").await, vec![Some("Main hall".into())]);

    let err = client
        .batch_execute("DELETE FROM resources WHERE id = 'hall'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("2BP01"));
}

#[tokio::test]
async fn extended_query_returns_typed_rows() {
    let addr = start_test_server().await;
    let client = connect(addr, "typed").await;
    create_resource(&client, "bay", 4).await;
    client.execute(RESERVE, &[&"bay", &"zed"]).await.unwrap();

    let rows = client
        .query("SELECT * FROM claims WHERE resource_id = $1", &[&"bay"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let claimant: String = rows[0].get("claimant_id");
    let created_at: i64 = rows[0].get("created_at");
    assert_eq!(claimant, "zed");
    assert!(created_at > 0);
}

#[tokio::test]
async fn databases_are_isolated_tenants() {
    let addr = start_test_server().await;
    let a = connect(addr, "tenant_a").await;
    let b = connect(addr, "tenant_b").await;
    create_resource(&a, "room", 1).await;

    let err = b.execute(RESERVE, &[&"room", &"alice"]).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    create_resource(&b, "room", 1).await;
    a.execute(RESERVE, &[&"room", &"alice"]).await.unwrap();
    assert_eq!(b.execute(RESERVE, &[&"room", &"bob"]).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_clients_never_overbook() {
    let addr = start_test_server().await;
    let setup = connect(addr, "contended").await;
    create_resource(&setup, "seat", 3).await;

    let mut handles = Vec::new();
    for i in 0..12 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, "contended").await;
            let claimant = format!("c{i}");
            client.execute(RESERVE, &[&"seat", &claimant]).await
        }));
    }

    let mut reserved = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(1) => reserved += 1,
            Ok(n) => panic!("unexpected row count {n}"),
            Err(e) => assert!(
                matches!(sqlstate(&e), Some("53400") | Some("40001")),
                "unexpected error: {e}"
            ),
        }
    }
    assert_eq!(reserved, 3);

    let claimants = column(
        &setup,
        "SELECT * FROM claims WHERE resource_id = 'seat'",
        "claimant_id",
    )
    .await;
    assert_eq!(claimants.len(), 3);
}
