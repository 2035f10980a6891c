use futures::future::BoxFuture;
use log::{debug, info};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::Repository;
use crate::config::DatabaseConfig;
use crate::error::{ProcessingError, Result};
use crate::model::{
    Account, ActionKind, Feed, FeedFormat, FeedItem, RetentionPolicy, Rule, Watermark,
};

/// PostgreSQL-backed repository.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL at {}:{}/{}", config.host, config.port, config.database);

        let pool = PgPool::connect(&config.url())
            .await
            .map_err(|e| ProcessingError::Storage(format!("unable to connect to database: {}", e)))?;

        info!("Database connection established");

        let repo = PgRepository { pool };
        repo.create_tables_if_not_exists().await?;
        Ok(repo)
    }

    async fn create_tables_if_not_exists(&self) -> Result<()> {
        info!("Checking/creating database tables");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                use_tls BOOLEAN NOT NULL DEFAULT TRUE,
                default_action TEXT NOT NULL DEFAULT 'none',
                default_folder TEXT,
                poll_interval_minutes INTEGER,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id UUID PRIMARY KEY,
                position BIGSERIAL,
                account_id UUID NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                folder TEXT NOT NULL,
                to_address TEXT,
                from_address TEXT,
                subject_contains TEXT,
                label TEXT,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                action TEXT,
                target_folder TEXT,
                inherit_defaults BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id UUID PRIMARY KEY,
                rule_id UUID NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                format TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                max_items INTEGER NOT NULL,
                min_items INTEGER NOT NULL,
                max_age_days INTEGER,
                CHECK (min_items <= max_items)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS feed_items (
                id UUID PRIMARY KEY,
                feed_id UUID NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                dedupe_key TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                summary TEXT NOT NULL,
                content TEXT NOT NULL,
                published_at TIMESTAMPTZ NOT NULL,
                ingested_at TIMESTAMPTZ NOT NULL,
                UNIQUE (feed_id, dedupe_key)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_feed_items_feed_published ON feed_items (feed_id, published_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS account_watermarks (
                account_id UUID PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
                folders TEXT NOT NULL,
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database tables checked/created successfully");
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let port: i32 = row.try_get("port")?;
    let action: String = row.try_get("default_action")?;
    let interval: Option<i32> = row.try_get("poll_interval_minutes")?;
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).unwrap_or(0),
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        use_tls: row.try_get("use_tls")?,
        default_action: ActionKind::parse(&action)?,
        default_folder: row.try_get("default_folder")?,
        poll_interval_minutes: interval.map(to_u32),
        active: row.try_get("active")?,
    })
}

fn rule_from_row(row: &PgRow) -> Result<Rule> {
    let action: Option<String> = row.try_get("action")?;
    Ok(Rule {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        folder: row.try_get("folder")?,
        to_address: row.try_get("to_address")?,
        from_address: row.try_get("from_address")?,
        subject_contains: row.try_get("subject_contains")?,
        label: row.try_get("label")?,
        active: row.try_get("active")?,
        action: action.as_deref().map(ActionKind::parse).transpose()?,
        target_folder: row.try_get("target_folder")?,
        inherit_defaults: row.try_get("inherit_defaults")?,
    })
}

fn feed_from_row(row: &PgRow) -> Result<Feed> {
    let format: String = row.try_get("format")?;
    let max_age: Option<i32> = row.try_get("max_age_days")?;
    Ok(Feed {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        title: row.try_get("title")?,
        format: FeedFormat::parse(&format)?,
        active: row.try_get("active")?,
        retention: RetentionPolicy {
            max_items: to_u32(row.try_get("max_items")?),
            min_items: to_u32(row.try_get("min_items")?),
            max_age_days: max_age.map(to_u32),
        },
    })
}

fn item_from_row(row: &PgRow) -> Result<FeedItem> {
    Ok(FeedItem {
        id: row.try_get("id")?,
        feed_id: row.try_get("feed_id")?,
        dedupe_key: row.try_get("dedupe_key")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        summary: row.try_get("summary")?,
        content: row.try_get("content")?,
        published_at: row.try_get("published_at")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

impl Repository for PgRepository {
    fn list_accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(account_from_row).collect()
        })
    }

    fn get_account(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(account_from_row).transpose()
        })
    }

    fn save_account<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            account.validate()?;
            sqlx::query(
                r#"
                INSERT INTO accounts
                (id, name, host, port, username, password, use_tls, default_action,
                 default_folder, poll_interval_minutes, active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    host = EXCLUDED.host,
                    port = EXCLUDED.port,
                    username = EXCLUDED.username,
                    password = EXCLUDED.password,
                    use_tls = EXCLUDED.use_tls,
                    default_action = EXCLUDED.default_action,
                    default_folder = EXCLUDED.default_folder,
                    poll_interval_minutes = EXCLUDED.poll_interval_minutes,
                    active = EXCLUDED.active
                "#,
            )
            .bind(account.id)
            .bind(&account.name)
            .bind(&account.host)
            .bind(i32::from(account.port))
            .bind(&account.username)
            .bind(&account.password)
            .bind(account.use_tls)
            .bind(account.default_action.as_str())
            .bind(&account.default_folder)
            .bind(account.poll_interval_minutes.map(|m| m as i32))
            .bind(account.active)
            .execute(&self.pool)
            .await?;
            debug!("Account saved: {}", account.name);
            Ok(())
        })
    }

    fn delete_account(&self, id: Uuid) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn rules_for_account(&self, account_id: Uuid) -> BoxFuture<'_, Result<Vec<Rule>>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT * FROM rules WHERE account_id = $1 ORDER BY position")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(rule_from_row).collect()
        })
    }

    fn save_rule<'a>(&'a self, rule: &'a Rule) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            rule.validate()?;
            sqlx::query(
                r#"
                INSERT INTO rules
                (id, account_id, name, folder, to_address, from_address, subject_contains,
                 label, active, action, target_folder, inherit_defaults)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    folder = EXCLUDED.folder,
                    to_address = EXCLUDED.to_address,
                    from_address = EXCLUDED.from_address,
                    subject_contains = EXCLUDED.subject_contains,
                    label = EXCLUDED.label,
                    active = EXCLUDED.active,
                    action = EXCLUDED.action,
                    target_folder = EXCLUDED.target_folder,
                    inherit_defaults = EXCLUDED.inherit_defaults
                "#,
            )
            .bind(rule.id)
            .bind(rule.account_id)
            .bind(&rule.name)
            .bind(&rule.folder)
            .bind(&rule.to_address)
            .bind(&rule.from_address)
            .bind(&rule.subject_contains)
            .bind(&rule.label)
            .bind(rule.active)
            .bind(rule.action.map(|a| a.as_str()))
            .bind(&rule.target_folder)
            .bind(rule.inherit_defaults)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn feeds_for_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Vec<Feed>>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT * FROM feeds WHERE rule_id = $1")
                .bind(rule_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(feed_from_row).collect()
        })
    }

    fn save_feed<'a>(&'a self, feed: &'a Feed) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            feed.validate()?;
            sqlx::query(
                r#"
                INSERT INTO feeds
                (id, rule_id, title, format, active, max_items, min_items, max_age_days)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    format = EXCLUDED.format,
                    active = EXCLUDED.active,
                    max_items = EXCLUDED.max_items,
                    min_items = EXCLUDED.min_items,
                    max_age_days = EXCLUDED.max_age_days
                "#,
            )
            .bind(feed.id)
            .bind(feed.rule_id)
            .bind(&feed.title)
            .bind(feed.format.as_str())
            .bind(feed.active)
            .bind(feed.retention.max_items as i32)
            .bind(feed.retention.min_items as i32)
            .bind(feed.retention.max_age_days.map(|d| d as i32))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn insert_item_if_absent<'a>(&'a self, item: &'a FeedItem) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO feed_items
                (id, feed_id, dedupe_key, title, author, summary, content, published_at, ingested_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (feed_id, dedupe_key) DO NOTHING
                "#,
            )
            .bind(item.id)
            .bind(item.feed_id)
            .bind(&item.dedupe_key)
            .bind(&item.title)
            .bind(&item.author)
            .bind(&item.summary)
            .bind(&item.content)
            .bind(item.published_at)
            .bind(item.ingested_at)
            .execute(&self.pool)
            .await?;

            let inserted = result.rows_affected() > 0;
            if !inserted {
                debug!("Existing item skipped: {} in feed {}", item.dedupe_key, item.feed_id);
            }
            Ok(inserted)
        })
    }

    fn list_items(&self, feed_id: Uuid) -> BoxFuture<'_, Result<Vec<FeedItem>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT * FROM feed_items WHERE feed_id = $1 ORDER BY published_at DESC, ingested_at DESC",
            )
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(item_from_row).collect()
        })
    }

    fn delete_items<'a>(&'a self, feed_id: Uuid, ids: &'a [Uuid]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let result = sqlx::query("DELETE FROM feed_items WHERE feed_id = $1 AND id = ANY($2)")
                .bind(feed_id)
                .bind(ids)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() as usize)
        })
    }

    fn load_watermark(&self, account_id: Uuid) -> BoxFuture<'_, Result<Watermark>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT folders FROM account_watermarks WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let cursor: String = row.try_get("folders")?;
                    Ok(serde_json::from_str(&cursor)?)
                }
                None => Ok(Watermark::default()),
            }
        })
    }

    fn save_watermark<'a>(&'a self, account_id: Uuid, watermark: &'a Watermark) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let cursor = serde_json::to_string(watermark)?;
            sqlx::query(
                r#"
                INSERT INTO account_watermarks (account_id, folders, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (account_id) DO UPDATE SET folders = EXCLUDED.folders, updated_at = NOW()
                "#,
            )
            .bind(account_id)
            .bind(cursor)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }
}
