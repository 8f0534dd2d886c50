//! Two documents sharing one event loop.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/postgres?sslmode=disable cargo run --example session
//! ```

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use pgmode::{MioNotifier, PgDriver, Registry, ResultSet};

fn render(identity: &str, sql: &str, result: pgmode::Result<pgmode::QueryOutcome>) {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("[{identity}] {sql}: {e}");
            return;
        }
    };
    println!("[{identity}] {sql} ({:?})", outcome.elapsed);
    for set in outcome.result_sets {
        match set {
            ResultSet::Tabular {
                columns,
                rows,
                row_count,
            } => {
                println!("  {}", columns.join(" | "));
                for row in rows {
                    let cells: Vec<&str> = row.iter().map(|v| v.as_deref().unwrap_or("NULL")).collect();
                    println!("  {}", cells.join(" | "));
                }
                println!("  ({row_count} rows)");
            }
            ResultSet::Command { status } => println!("  {status}"),
            ResultSet::Error { message } => println!("  error: {message}"),
        }
    }
}

fn main() -> pgmode::Result<()> {
    tracing_subscriber::fmt::init();

    let url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/postgres?sslmode=disable".to_string());
    let targets = HashMap::from([("reports.sql", url.clone()), ("scratch.sql", url)]);
    let mut registry = Registry::new(PgDriver, MioNotifier::new()?, targets);

    let work = [
        ("reports.sql", "SELECT current_user, current_database()"),
        ("scratch.sql", "SELECT pg_sleep(0.2); SELECT 'slow' AS kind"),
        ("reports.sql", "SELECT n, n * n AS square FROM generate_series(1, 4) n"),
        ("scratch.sql", "CREATE TEMP TABLE notes (body text); INSERT INTO notes VALUES ('hi')"),
        ("reports.sql", "SELECT 1/0"),
    ];

    for identity in ["reports.sql", "scratch.sql"] {
        registry.ensure_connected(&identity, move |result| match result {
            Ok(()) => println!("[{identity}] connected"),
            Err(e) => println!("[{identity}] {e}"),
        });
    }
    for (identity, sql) in work {
        registry.send_query(&identity, sql, move |result| render(identity, sql, result));
    }

    while !registry.is_idle() {
        registry.turn(Some(Duration::from_secs(30)))?;
    }

    for identity in ["reports.sql", "scratch.sql"] {
        println!("[{identity}] {:?}", registry.status(&identity));
    }
    registry.disconnect_all();
    Ok(())
}
