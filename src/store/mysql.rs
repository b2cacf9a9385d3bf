use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};

use crate::profile::{ProfileId, MYSQL_DATABASE, MYSQL_HOST, MYSQL_PASSWORD, MYSQL_USER};
use crate::schema::{self, split_statements};
use crate::settings;
use crate::store::{
    sql, BookRecord, CategoryRecord, EntityKind, EntityRecord, EntityStore, OrderItemRecord,
    OrderRecord, PingError, SchemaPresence, SettingsMap, UpsertOutcome, UserRecord, VideoRecord,
    WriteError,
};
use crate::{AppError, AppResult};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Access denied for the supplied credentials (ER_DBACCESS_DENIED_ERROR,
/// ER_ACCESS_DENIED_ERROR).
const ACCESS_DENIED_CODES: [u16; 2] = [1044, 1045];

/// Remote MySQL backend. The pool connects lazily so that connection
/// failures surface through `ping`, where they can be classified and
/// retried, instead of at construction time.
#[derive(Debug)]
pub struct MysqlStore {
    pool: MySqlPool,
    host: String,
}

impl MysqlStore {
    pub fn connect(settings: &SettingsMap) -> AppResult<Self> {
        let host_port = settings::require(settings, MYSQL_HOST)?;
        let (host, port) = settings::split_host_port(host_port)?;
        let opts = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(settings::require(settings, MYSQL_USER)?)
            .password(settings::require(settings, MYSQL_PASSWORD)?)
            .database(settings::require(settings, MYSQL_DATABASE)?);

        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(opts);

        tracing::info!(
            target: "switchboard",
            event = "store_open",
            backend = "mysql",
            host = %host_port
        );

        Ok(Self {
            pool,
            host: host_port.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let found = sqlx::query(sql::MYSQL_TABLE_EXISTS)
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn category_id(&self, name: &str) -> Result<i64, WriteError> {
        let row = sqlx::query(sql::SELECT_CATEGORY_ID)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        match row {
            Some(row) => row
                .try_get("id")
                .map_err(|e| WriteError::Row(format!("category id for '{name}': {e}"))),
            None => Err(WriteError::Row(format!("unknown category '{name}'"))),
        }
    }

    async fn optional_category_id(
        &self,
        category: Option<&str>,
    ) -> Result<Option<i64>, WriteError> {
        match category {
            Some(name) => Ok(Some(self.category_id(name).await?)),
            None => Ok(None),
        }
    }

    async fn user_id(&self, email: &str) -> Result<i64, WriteError> {
        let row = sqlx::query(sql::SELECT_USER_ID)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        match row {
            Some(row) => row
                .try_get("id")
                .map_err(|e| WriteError::Row(format!("user id for '{email}': {e}"))),
            None => Err(WriteError::Row(format!("unknown user '{email}'"))),
        }
    }

    async fn book_id(&self, title: &str, author: &str) -> Result<i64, WriteError> {
        let row = sqlx::query(sql::SELECT_BOOK_ID)
            .bind(title)
            .bind(author)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        match row {
            Some(row) => row
                .try_get("id")
                .map_err(|e| WriteError::Row(format!("book id for '{title}': {e}"))),
            None => Err(WriteError::Row(format!("unknown book '{title}' by '{author}'"))),
        }
    }

    async fn order_id(&self, order_ref: &str) -> Result<i64, WriteError> {
        let row = sqlx::query(sql::SELECT_ORDER_ID)
            .bind(order_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        match row {
            Some(row) => row
                .try_get("id")
                .map_err(|e| WriteError::Row(format!("order id for '{order_ref}': {e}"))),
            None => Err(WriteError::Row(format!("unknown order '{order_ref}'"))),
        }
    }

    async fn upsert_category(
        &self,
        incoming: &CategoryRecord,
    ) -> Result<UpsertOutcome, WriteError> {
        let existing = sqlx::query(sql::SELECT_CATEGORY_BY_NAME)
            .bind(&incoming.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_CATEGORY)
                .bind(&incoming.name)
                .bind(incoming.created_at_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert category", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(category_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_CATEGORY)
            .bind(incoming.created_at_ms)
            .bind(&incoming.name)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update category", e))?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_user(&self, incoming: &UserRecord) -> Result<UpsertOutcome, WriteError> {
        let existing = sqlx::query(sql::SELECT_USER_BY_EMAIL)
            .bind(&incoming.email)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_USER)
                .bind(&incoming.email)
                .bind(&incoming.display_name)
                .bind(incoming.created_at_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert user", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(user_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_USER)
            .bind(&incoming.display_name)
            .bind(incoming.created_at_ms)
            .bind(&incoming.email)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update user", e))?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_book(&self, incoming: &BookRecord) -> Result<UpsertOutcome, WriteError> {
        let category_id = self
            .optional_category_id(incoming.category.as_deref())
            .await?;
        let existing = sqlx::query(sql::SELECT_BOOK_BY_KEY)
            .bind(&incoming.title)
            .bind(&incoming.author)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_BOOK)
                .bind(&incoming.title)
                .bind(&incoming.author)
                .bind(category_id)
                .bind(incoming.price_cents)
                .bind(incoming.created_at_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert book", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(book_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_BOOK)
            .bind(category_id)
            .bind(incoming.price_cents)
            .bind(incoming.created_at_ms)
            .bind(&incoming.title)
            .bind(&incoming.author)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update book", e))?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_video(&self, incoming: &VideoRecord) -> Result<UpsertOutcome, WriteError> {
        let category_id = self
            .optional_category_id(incoming.category.as_deref())
            .await?;
        let existing = sqlx::query(sql::SELECT_VIDEO_BY_TITLE)
            .bind(&incoming.title)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_VIDEO)
                .bind(&incoming.title)
                .bind(category_id)
                .bind(incoming.duration_seconds)
                .bind(incoming.created_at_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert video", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(video_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_VIDEO)
            .bind(category_id)
            .bind(incoming.duration_seconds)
            .bind(incoming.created_at_ms)
            .bind(&incoming.title)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update video", e))?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_order(&self, incoming: &OrderRecord) -> Result<UpsertOutcome, WriteError> {
        let user_id = self.user_id(&incoming.user_email).await?;
        let existing = sqlx::query(sql::SELECT_ORDER_BY_REF)
            .bind(&incoming.order_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_ORDER)
                .bind(&incoming.order_ref)
                .bind(user_id)
                .bind(incoming.total_cents)
                .bind(incoming.placed_at_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert order", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(order_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_ORDER)
            .bind(user_id)
            .bind(incoming.total_cents)
            .bind(incoming.placed_at_ms)
            .bind(&incoming.order_ref)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update order", e))?;
        Ok(UpsertOutcome::Updated)
    }

    async fn upsert_order_item(
        &self,
        incoming: &OrderItemRecord,
    ) -> Result<UpsertOutcome, WriteError> {
        let order_id = self.order_id(&incoming.order_ref).await?;
        let book_id = self
            .book_id(&incoming.book_title, &incoming.book_author)
            .await?;
        let existing = sqlx::query(sql::SELECT_ORDER_ITEM_BY_KEY)
            .bind(&incoming.order_ref)
            .bind(incoming.line_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(fatal)?;
        let Some(row) = existing else {
            sqlx::query(sql::INSERT_ORDER_ITEM)
                .bind(order_id)
                .bind(incoming.line_no)
                .bind(book_id)
                .bind(incoming.quantity)
                .bind(incoming.unit_price_cents)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error("insert order item", e))?;
            return Ok(UpsertOutcome::Inserted);
        };
        if matches!(order_item_from_row(&row), Ok(current) if current == *incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }
        sqlx::query(sql::UPDATE_ORDER_ITEM)
            .bind(book_id)
            .bind(incoming.quantity)
            .bind(incoming.unit_price_cents)
            .bind(order_id)
            .bind(incoming.line_no)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update order item", e))?;
        Ok(UpsertOutcome::Updated)
    }
}

#[async_trait]
impl EntityStore for MysqlStore {
    fn profile(&self) -> ProfileId {
        ProfileId::Mysql
    }

    async fn ping(&self) -> Result<(), PingError> {
        sqlx::query(sql::PING)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| classify_ping(e, &self.host))
    }

    async fn schema_presence(&self) -> AppResult<SchemaPresence> {
        let mut missing = Vec::new();
        for table in schema::ENTITY_TABLES {
            if !self.table_exists(table).await? {
                missing.push(table.to_string());
            }
        }
        if missing.is_empty() {
            Ok(SchemaPresence::Present)
        } else {
            Ok(SchemaPresence::Absent { missing })
        }
    }

    async fn apply_schema(&self) -> AppResult<()> {
        // MySQL commits implicitly around DDL, so no transaction here.
        let statements = split_statements(schema::MYSQL_DDL);
        let mut conn = self.pool.acquire().await?;
        for stmt in &statements {
            sqlx::query(stmt).execute(&mut *conn).await.map_err(|e| {
                AppError::from(e).with_context("statement", schema::statement_preview(stmt))
            })?;
        }
        tracing::info!(
            target: "switchboard",
            event = "schema_applied",
            backend = "mysql",
            statements = statements.len()
        );
        Ok(())
    }

    async fn read_all(&self, entity: EntityKind) -> AppResult<Vec<Result<EntityRecord, String>>> {
        if !self.table_exists(entity.table()).await? {
            return Ok(Vec::new());
        }
        let query = match entity {
            EntityKind::Categories => sql::SELECT_ALL_CATEGORIES,
            EntityKind::Users => sql::SELECT_ALL_USERS,
            EntityKind::Books => sql::SELECT_ALL_BOOKS,
            EntityKind::Videos => sql::SELECT_ALL_VIDEOS,
            EntityKind::Orders => sql::SELECT_ALL_ORDERS,
            EntityKind::OrderItems => sql::SELECT_ALL_ORDER_ITEMS,
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| record_from_row(entity, row)).collect())
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, WriteError> {
        match record {
            EntityRecord::Category(c) => self.upsert_category(c).await,
            EntityRecord::User(u) => self.upsert_user(u).await,
            EntityRecord::Book(b) => self.upsert_book(b).await,
            EntityRecord::Video(v) => self.upsert_video(v).await,
            EntityRecord::Order(o) => self.upsert_order(o).await,
            EntityRecord::OrderItem(i) => self.upsert_order_item(i).await,
        }
    }

    async fn count(&self, entity: EntityKind) -> AppResult<i64> {
        if !self.table_exists(entity.table()).await? {
            return Ok(0);
        }
        let row = sqlx::query(&sql::count_query(entity.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn classify_ping(err: sqlx::Error, host: &str) -> PingError {
    let denied = matches!(
        &err,
        sqlx::Error::Database(db) if is_access_denied(db.as_ref())
    );
    let app = AppError::from(err)
        .with_context("backend", "mysql")
        .with_context("host", host.to_string());
    if denied {
        PingError::Auth(app)
    } else {
        PingError::Transient(app)
    }
}

fn is_access_denied(db: &dyn sqlx::error::DatabaseError) -> bool {
    db.try_downcast_ref::<MySqlDatabaseError>()
        .is_some_and(|mysql| ACCESS_DENIED_CODES.contains(&mysql.number()))
}

fn fatal(err: sqlx::Error) -> WriteError {
    WriteError::Fatal(AppError::from(err))
}

fn write_error(context: &str, err: sqlx::Error) -> WriteError {
    match err {
        sqlx::Error::Database(db) => WriteError::Row(format!("{context}: {}", db.message())),
        other => WriteError::Fatal(AppError::from(other)),
    }
}

fn get<'r, T>(row: &'r MySqlRow, column: &str) -> Result<T, String>
where
    T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>,
{
    row.try_get(column)
        .map_err(|e| format!("column {column}: {e}"))
}

fn category_from_row(row: &MySqlRow) -> Result<CategoryRecord, String> {
    Ok(CategoryRecord {
        name: get(row, "name")?,
        created_at_ms: get(row, "created_at")?,
    })
}

fn user_from_row(row: &MySqlRow) -> Result<UserRecord, String> {
    Ok(UserRecord {
        email: get(row, "email")?,
        display_name: get(row, "display_name")?,
        created_at_ms: get(row, "created_at")?,
    })
}

fn book_from_row(row: &MySqlRow) -> Result<BookRecord, String> {
    let title: String = get(row, "title")?;
    let category_id: Option<i64> = get(row, "category_id")?;
    let category: Option<String> = get(row, "category")?;
    if let (Some(id), None) = (category_id, &category) {
        return Err(format!("book '{title}' references missing category id {id}"));
    }
    Ok(BookRecord {
        author: get(row, "author")?,
        category,
        price_cents: get(row, "price_cents")?,
        created_at_ms: get(row, "created_at")?,
        title,
    })
}

fn video_from_row(row: &MySqlRow) -> Result<VideoRecord, String> {
    let title: String = get(row, "title")?;
    let category_id: Option<i64> = get(row, "category_id")?;
    let category: Option<String> = get(row, "category")?;
    if let (Some(id), None) = (category_id, &category) {
        return Err(format!("video '{title}' references missing category id {id}"));
    }
    Ok(VideoRecord {
        category,
        duration_seconds: get(row, "duration_seconds")?,
        created_at_ms: get(row, "created_at")?,
        title,
    })
}

fn order_from_row(row: &MySqlRow) -> Result<OrderRecord, String> {
    let order_ref: String = get(row, "order_ref")?;
    let user_email: Option<String> = get(row, "user_email")?;
    let Some(user_email) = user_email else {
        return Err(format!("order '{order_ref}' references a missing user"));
    };
    Ok(OrderRecord {
        user_email,
        total_cents: get(row, "total_cents")?,
        placed_at_ms: get(row, "placed_at")?,
        order_ref,
    })
}

fn order_item_from_row(row: &MySqlRow) -> Result<OrderItemRecord, String> {
    let order_ref: Option<String> = get(row, "order_ref")?;
    let line_no: i64 = get(row, "line_no")?;
    let Some(order_ref) = order_ref else {
        return Err(format!("order item line {line_no} references a missing order"));
    };
    let book_title: Option<String> = get(row, "book_title")?;
    let book_author: Option<String> = get(row, "book_author")?;
    let (Some(book_title), Some(book_author)) = (book_title, book_author) else {
        return Err(format!(
            "order item '{order_ref}' line {line_no} references a missing book"
        ));
    };
    Ok(OrderItemRecord {
        order_ref,
        line_no,
        book_title,
        book_author,
        quantity: get(row, "quantity")?,
        unit_price_cents: get(row, "unit_price_cents")?,
    })
}

fn record_from_row(entity: EntityKind, row: &MySqlRow) -> Result<EntityRecord, String> {
    match entity {
        EntityKind::Categories => category_from_row(row).map(EntityRecord::Category),
        EntityKind::Users => user_from_row(row).map(EntityRecord::User),
        EntityKind::Books => book_from_row(row).map(EntityRecord::Book),
        EntityKind::Videos => video_from_row(row).map(EntityRecord::Video),
        EntityKind::Orders => order_from_row(row).map(EntityRecord::Order),
        EntityKind::OrderItems => order_item_from_row(row).map(EntityRecord::OrderItem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(dsn_host: &str) -> SettingsMap {
        let mut settings = SettingsMap::new();
        settings.insert(MYSQL_HOST.to_string(), dsn_host.to_string());
        settings.insert(MYSQL_USER.to_string(), "switchboard".to_string());
        settings.insert(MYSQL_PASSWORD.to_string(), "secret".to_string());
        settings.insert(MYSQL_DATABASE.to_string(), "switchboard_test".to_string());
        settings
    }

    #[tokio::test]
    async fn connect_is_lazy_and_does_not_touch_the_network() {
        let store = MysqlStore::connect(&test_settings("203.0.113.1:3306")).expect("lazy pool");
        assert_eq!(store.profile(), ProfileId::Mysql);
        assert_eq!(store.host(), "203.0.113.1:3306");
    }

    #[test]
    fn connect_rejects_missing_settings() {
        let mut settings = test_settings("localhost:3306");
        settings.remove(MYSQL_PASSWORD);
        let err = MysqlStore::connect(&settings).expect_err("missing password");
        assert_eq!(err.code(), "CONFIG/MISSING_SETTING");
    }

    // Live round-trips run only when a disposable server is provided.
    #[tokio::test]
    async fn live_roundtrip_when_dsn_provided() {
        let Ok(host) = std::env::var("SWITCHBOARD_TEST_MYSQL_DSN") else {
            return;
        };
        let mut settings = SettingsMap::new();
        for pair in host.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                settings.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        let store = MysqlStore::connect(&settings).unwrap();
        store.ping().await.expect("server reachable");
        store.apply_schema().await.unwrap();
        assert_eq!(
            store.schema_presence().await.unwrap(),
            SchemaPresence::Present
        );

        let record = EntityRecord::Category(CategoryRecord {
            name: "live-smoke".into(),
            created_at_ms: 42,
        });
        let first = store.upsert(&record).await.unwrap();
        assert!(matches!(
            first,
            UpsertOutcome::Inserted | UpsertOutcome::Unchanged
        ));
        assert_eq!(
            store.upsert(&record).await.unwrap(),
            UpsertOutcome::Unchanged
        );
    }
}
