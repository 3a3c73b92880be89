//! Article registry: code → identity, get-or-create.

use sqlx::PgConnection;

use crate::error::Result;
use crate::model::{ArticleId, normalize_code};

/// Get-or-create on an open connection or transaction.
///
/// The unique index on `code` arbitrates concurrent inserts. The loser's
/// insert becomes a no-op and falls through to the lookup.
pub(crate) async fn article_id(conn: &mut PgConnection, code: &str) -> Result<ArticleId> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO articles (code) VALUES ($1)
         ON CONFLICT (code) DO NOTHING
         RETURNING id",
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = inserted {
        return Ok(ArticleId(id));
    }

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM articles WHERE code = $1")
        .bind(code)
        .fetch_one(&mut *conn)
        .await?;
    Ok(ArticleId(id))
}

impl super::Db {
    /// Identity for `code`, registering it on first use.
    pub async fn get_or_create_article(&self, code: &str) -> Result<ArticleId> {
        let code = normalize_code(code)?;
        let mut conn = self.pool.acquire().await?;
        article_id(&mut conn, code).await
    }
}
