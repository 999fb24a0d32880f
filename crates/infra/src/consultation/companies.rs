use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use fiscalq_core::CompanyId;
use fiscalq_queue::{CompanyDirectory, Credentials, DirectoryError};

#[derive(Debug, Clone)]
struct CompanyEntry {
    credentials: Credentials,
    active: bool,
}

/// In-memory company directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCompanyDirectory {
    companies: RwLock<HashMap<CompanyId, CompanyEntry>>,
}

impl InMemoryCompanyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active company.
    pub fn add(&self, company_id: CompanyId, credentials: Credentials) {
        self.companies.write().unwrap().insert(
            company_id,
            CompanyEntry {
                credentials,
                active: true,
            },
        );
    }

    pub fn set_active(&self, company_id: CompanyId, active: bool) {
        if let Some(entry) = self.companies.write().unwrap().get_mut(&company_id) {
            entry.active = active;
        }
    }
}

#[async_trait]
impl CompanyDirectory for InMemoryCompanyDirectory {
    async fn company_exists(&self, company_id: CompanyId) -> Result<bool, DirectoryError> {
        Ok(self
            .companies
            .read()
            .unwrap()
            .get(&company_id)
            .is_some_and(|c| c.active))
    }

    async fn credentials(&self, company_id: CompanyId) -> Result<Option<Credentials>, DirectoryError> {
        Ok(self
            .companies
            .read()
            .unwrap()
            .get(&company_id)
            .filter(|c| c.active)
            .map(|c| c.credentials.clone()))
    }
}

/// Company directory over the `companies` table.
///
/// Only rows with `active = 1` count as existing companies.
#[derive(Debug, Clone)]
pub struct SqliteCompanyDirectory {
    pool: SqlitePool,
}

impl SqliteCompanyDirectory {
    /// Use `pool` and create the table if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, DirectoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id                 INTEGER PRIMARY KEY,
                name               TEXT    NOT NULL,
                login              TEXT    NOT NULL,
                password           TEXT    NOT NULL,
                state_registration TEXT    NOT NULL,
                active             INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(unavailable)?;

        Ok(Self { pool })
    }

    /// Insert or replace a company row.
    pub async fn upsert(
        &self,
        company_id: CompanyId,
        name: &str,
        credentials: &Credentials,
        active: bool,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            r#"
            INSERT INTO companies (id, name, login, password, state_registration, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                login = excluded.login,
                password = excluded.password,
                state_registration = excluded.state_registration,
                active = excluded.active
            "#,
        )
        .bind(company_id.get())
        .bind(name)
        .bind(&credentials.login)
        .bind(&credentials.password)
        .bind(&credentials.state_registration)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(e.to_string())
}

#[async_trait]
impl CompanyDirectory for SqliteCompanyDirectory {
    #[instrument(skip(self), err)]
    async fn company_exists(&self, company_id: CompanyId) -> Result<bool, DirectoryError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM companies WHERE id = $1 AND active = 1) AS present",
        )
        .bind(company_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let present: i64 = row.try_get("present").map_err(unavailable)?;
        Ok(present != 0)
    }

    #[instrument(skip(self), err)]
    async fn credentials(&self, company_id: CompanyId) -> Result<Option<Credentials>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT login, password, state_registration
            FROM companies
            WHERE id = $1 AND active = 1
            "#,
        )
        .bind(company_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|row| {
            Ok(Credentials {
                login: row.try_get("login").map_err(unavailable)?,
                password: row.try_get("password").map_err(unavailable)?,
                state_registration: row.try_get("state_registration").map_err(unavailable)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SqliteJobStore;

    fn creds(login: &str) -> Credentials {
        Credentials {
            login: login.to_string(),
            password: "s3cret".to_string(),
            state_registration: "0012345".to_string(),
        }
    }

    #[tokio::test]
    async fn in_memory_directory_hides_inactive_companies() {
        let dir = InMemoryCompanyDirectory::new();
        dir.add(CompanyId::new(1), creds("a"));

        assert!(dir.company_exists(CompanyId::new(1)).await.unwrap());
        assert!(!dir.company_exists(CompanyId::new(2)).await.unwrap());

        dir.set_active(CompanyId::new(1), false);
        assert!(!dir.company_exists(CompanyId::new(1)).await.unwrap());
        assert_eq!(dir.credentials(CompanyId::new(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_directory_reads_active_rows() {
        let store = SqliteJobStore::connect("sqlite::memory:").await.unwrap();
        let dir = SqliteCompanyDirectory::from_pool(store.pool().clone())
            .await
            .unwrap();

        dir.upsert(CompanyId::new(10), "Padaria Central", &creds("10"), true)
            .await
            .unwrap();
        dir.upsert(CompanyId::new(11), "Mercado Norte", &creds("11"), false)
            .await
            .unwrap();

        assert!(dir.company_exists(CompanyId::new(10)).await.unwrap());
        assert!(!dir.company_exists(CompanyId::new(11)).await.unwrap());
        assert!(!dir.company_exists(CompanyId::new(12)).await.unwrap());
        assert_eq!(
            dir.credentials(CompanyId::new(10)).await.unwrap(),
            Some(creds("10"))
        );
        assert_eq!(dir.credentials(CompanyId::new(11)).await.unwrap(), None);

        dir.upsert(CompanyId::new(11), "Mercado Norte", &creds("11b"), true)
            .await
            .unwrap();
        assert_eq!(
            dir.credentials(CompanyId::new(11)).await.unwrap(),
            Some(creds("11b"))
        );
    }
}
