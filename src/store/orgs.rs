//! Tradable organizations (perpetual tickers).

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::Organization;

fn row_to_org(row: &Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        ticker: row.get(1)?,
        name: row.get(2)?,
        initial_price: row.get(3)?,
        current_price: row.get(4)?,
        funding_rate: row.get(5)?,
        last_funding_at: row.get(6)?,
    })
}

const ORG_COLUMNS: &str =
    "id, ticker, name, initial_price, current_price, funding_rate, last_funding_at";

pub(crate) fn get_by_ticker(conn: &Connection, ticker: &str) -> EngineResult<Organization> {
    conn.query_row(
        &format!("SELECT {ORG_COLUMNS} FROM organizations WHERE ticker = ?1"),
        params![ticker],
        row_to_org,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            EngineError::NotFound(format!("organization {ticker}"))
        }
        other => other.into(),
    })
}

pub(crate) fn set_price(conn: &Connection, ticker: &str, price: f64) -> EngineResult<()> {
    let n = conn.execute(
        "UPDATE organizations SET current_price = ?1 WHERE ticker = ?2",
        params![price, ticker],
    )?;
    if n == 0 {
        return Err(EngineError::NotFound(format!("organization {ticker}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct OrganizationStore {
    db: Db,
}

impl OrganizationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        ticker: &str,
        name: &str,
        initial_price: f64,
    ) -> EngineResult<Organization> {
        if !(initial_price.is_finite() && initial_price > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "initial price must be positive, got {initial_price}"
            )));
        }
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO organizations (ticker, name, initial_price, current_price) \
             VALUES (?1, ?2, ?3, ?3)",
            params![ticker, name, initial_price],
        )?;
        get_by_ticker(&conn, ticker)
    }

    pub async fn get(&self, ticker: &str) -> EngineResult<Organization> {
        let conn = self.db.lock().await;
        get_by_ticker(&conn, ticker)
    }

    pub async fn list(&self) -> EngineResult<Vec<Organization>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations ORDER BY ticker ASC"
        ))?;
        let rows = stmt.query_map([], row_to_org)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn set_current_price(&self, ticker: &str, price: f64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        set_price(&conn, ticker, price)
    }

    pub async fn set_funding(
        &self,
        ticker: &str,
        funding_rate: f64,
        funded_at: i64,
    ) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let n = conn.execute(
            "UPDATE organizations SET funding_rate = ?1, last_funding_at = ?2 WHERE ticker = ?3",
            params![funding_rate, funded_at, ticker],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("organization {ticker}")));
        }
        Ok(())
    }
}
