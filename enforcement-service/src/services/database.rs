//! PostgreSQL storage for enforcement-service.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    AccountingRecord, ActiveSession, CreateCustomer, CreatePlan, CreateSubscription, Customer,
    FoldResult, Invoice, InvoiceItem, InvoiceStatus, IssueInvoice, LifecycleUpdate, NasDevice,
    Payment, RecordPayment, RecordedPayment, ServicePlan, Subscription, UsageAggregate, UsageRange,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{check_payment, AccountingSource, SessionDirectory, Store};

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, customer_id, plan_id, status, \
    suspension_reason, monthly_quota_bytes, used_quota_bytes, quota_warned, throttled, \
    next_billing_date, nas_username, coa_failures, last_coa_result, last_coa_utc, version, \
    created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, customer_id, subscription_id, \
    status, currency, issue_date, due_date, total_amount, paid_amount, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, payment_number, invoice_id, customer_id, amount, \
    currency, method, status, reference, payment_date, created_utc";

fn db_error(action: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

async fn connect(
    database_url: &str,
    max_connections: u32,
    min_connections: u32,
) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))
}

/// Next value of a per-period document counter.
///
/// The counter row is seeded from the number of documents already carrying
/// the prefix, so numbering continues correctly for pre-existing data.
async fn next_sequence(
    tx: &mut Transaction<'_, Postgres>,
    prefix: &str,
    table: &'static str,
    number_column: &'static str,
) -> Result<i64, AppError> {
    let query = format!(
        r#"
        INSERT INTO invoice_sequences (prefix, last_value)
        VALUES ($1, (SELECT COUNT(*) FROM {table} WHERE {number_column} LIKE $1 || '%') + 1)
        ON CONFLICT (prefix) DO UPDATE SET last_value = invoice_sequences.last_value + 1
        RETURNING last_value
        "#
    );
    sqlx::query_scalar::<_, i64>(&query)
        .bind(prefix)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error("allocate document number"))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "enforcement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = connect(database_url, max_connections, min_connections).await?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Distinguish a lost version check from a missing row.
    async fn version_miss(&self, subscription_id: Uuid) -> AppError {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscriptions WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(0) => AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                subscription_id
            )),
            Ok(_) => AppError::Conflict(anyhow::anyhow!(
                "Subscription {} was modified concurrently",
                subscription_id
            )),
            Err(e) => db_error("check subscription")(e),
        }
    }

    async fn list_subscriptions_where(
        &self,
        operation: &'static str,
        predicate: &str,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let query = format!(
            "SELECT {} FROM subscriptions WHERE {} ORDER BY created_utc, subscription_id",
            SUBSCRIPTION_COLUMNS, predicate
        );
        let rows = sqlx::query_as::<_, Subscription>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list subscriptions"))?;

        timer.observe_duration();
        Ok(rows)
    }
}

#[async_trait]
impl Store for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    #[instrument(skip(self, input), fields(email = %input.email))]
    async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (customer_id, display_name, email, phone)
            VALUES ($1, $2, $3, $4)
            RETURNING customer_id, display_name, email, phone, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.display_name)
        .bind(&input.email)
        .bind(&input.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create customer"))?;

        timer.observe_duration();
        info!(customer_id = %customer.customer_id, "Customer created");

        Ok(customer)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn create_plan(&self, input: &CreatePlan) -> Result<ServicePlan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, ServicePlan>(
            r#"
            INSERT INTO service_plans (plan_id, name, monthly_fee, currency, rate_limit, fup_enabled, fup_rate_limit)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING plan_id, name, monthly_fee, currency, rate_limit, fup_enabled, fup_rate_limit, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.monthly_fee)
        .bind(&input.currency)
        .bind(&input.rate_limit)
        .bind(input.fup_enabled)
        .bind(&input.fup_rate_limit)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create plan"))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan)
    }

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id, username = %input.nas_username))]
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let (status, reason) = input.state.to_columns();
        let query = format!(
            r#"
            INSERT INTO subscriptions (subscription_id, customer_id, plan_id, status, suspension_reason,
                monthly_quota_bytes, next_billing_date, nas_username)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, Subscription>(&query)
            .bind(Uuid::new_v4())
            .bind(input.customer_id)
            .bind(input.plan_id)
            .bind(status)
            .bind(reason)
            .bind(input.monthly_quota_bytes)
            .bind(input.next_billing_date)
            .bind(&input.nas_username)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("create subscription"))?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription created");

        Ok(subscription)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            "SELECT customer_id, display_name, email, phone, created_utc FROM customers WHERE customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get customer"))?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<ServicePlan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, ServicePlan>(
            r#"
            SELECT plan_id, name, monthly_fee, currency, rate_limit, fup_enabled, fup_rate_limit, is_active, created_utc
            FROM service_plans WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get plan"))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let query = format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, Subscription>(&query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get subscription"))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn find_subscription_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_username"])
            .start_timer();

        let query = format!(
            "SELECT {} FROM subscriptions WHERE nas_username = $1 AND status <> 'terminated'",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, Subscription>(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find subscription by username"))?;

        timer.observe_duration();
        Ok(subscription)
    }

    async fn list_quota_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        self.list_subscriptions_where(
            "list_quota_subscriptions",
            "status = 'active' AND monthly_quota_bytes IS NOT NULL AND monthly_quota_bytes > 0",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_due_subscriptions(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_subscriptions"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status = 'active' AND next_billing_date <= $1
            ORDER BY next_billing_date, subscription_id
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, Subscription>(&query)
            .bind(as_of)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list due subscriptions"))?;

        timer.observe_duration();
        Ok(rows)
    }

    async fn list_open_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        self.list_subscriptions_where("list_open_subscriptions", "status <> 'terminated'")
            .await
    }

    #[instrument(skip(self))]
    async fn list_customer_subscriptions(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customer_subscriptions"])
            .start_timer();

        let query = format!(
            "SELECT {} FROM subscriptions WHERE customer_id = $1 ORDER BY created_utc",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, Subscription>(&query)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list customer subscriptions"))?;

        timer.observe_duration();
        Ok(rows)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self, update), fields(status = update.state.status().as_str()))]
    async fn update_lifecycle(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_lifecycle"])
            .start_timer();

        let (status, reason) = update.state.to_columns();
        let query = format!(
            r#"
            UPDATE subscriptions
            SET status = $3, suspension_reason = $4, quota_warned = $5, throttled = $6,
                version = version + 1, updated_utc = NOW()
            WHERE subscription_id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let updated = sqlx::query_as::<_, Subscription>(&query)
            .bind(subscription_id)
            .bind(expected_version)
            .bind(status)
            .bind(reason)
            .bind(update.quota_warned)
            .bind(update.throttled)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("update subscription lifecycle"))?;

        timer.observe_duration();
        match updated {
            Some(subscription) => Ok(subscription),
            None => Err(self.version_miss(subscription_id).await),
        }
    }

    #[instrument(skip(self, update))]
    async fn reset_quota(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_quota"])
            .start_timer();

        let (status, reason) = update.state.to_columns();
        let query = format!(
            r#"
            UPDATE subscriptions
            SET used_quota_bytes = 0, status = $3, suspension_reason = $4, quota_warned = $5,
                throttled = $6, version = version + 1, updated_utc = NOW()
            WHERE subscription_id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let updated = sqlx::query_as::<_, Subscription>(&query)
            .bind(subscription_id)
            .bind(expected_version)
            .bind(status)
            .bind(reason)
            .bind(update.quota_warned)
            .bind(update.throttled)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("reset quota"))?;

        timer.observe_duration();
        match updated {
            Some(subscription) => Ok(subscription),
            None => Err(self.version_miss(subscription_id).await),
        }
    }

    #[instrument(skip(self))]
    async fn record_coa_outcome(
        &self,
        subscription_id: Uuid,
        result: &str,
        failed: bool,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_coa_outcome"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_coa_result = $2, last_coa_utc = NOW(),
                coa_failures = CASE WHEN $3 THEN coa_failures + 1 ELSE 0 END
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(result)
        .bind(failed)
        .execute(&self.pool)
        .await
        .map_err(db_error("record CoA outcome"))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Usage
    // =========================================================================

    #[instrument(skip(self, records), fields(rows = records.len()))]
    async fn fold_usage(
        &self,
        subscription_id: Uuid,
        usage_date: NaiveDate,
        records: &[AccountingRecord],
    ) -> Result<FoldResult, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fold_usage"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let mut result = FoldResult::default();
        let (mut input_octets, mut output_octets, mut session_time) = (0i64, 0i64, 0i64);

        for record in records {
            let inserted = sqlx::query(
                r#"
                INSERT INTO folded_sessions (unique_id, subscription_id)
                VALUES ($1, $2)
                ON CONFLICT (unique_id) DO NOTHING
                "#,
            )
            .bind(&record.unique_id)
            .bind(subscription_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("mark session folded"))?
            .rows_affected();

            if inserted == 0 {
                result.duplicate_rows += 1;
                continue;
            }

            result.folded_rows += 1;
            input_octets = input_octets.saturating_add(record.input_octets);
            output_octets = output_octets.saturating_add(record.output_octets);
            session_time = session_time.saturating_add(record.session_time);
        }

        if result.folded_rows > 0 {
            sqlx::query(
                r#"
                INSERT INTO usage_aggregates (subscription_id, usage_date, input_octets, output_octets, session_time, session_count)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (subscription_id, usage_date) DO UPDATE SET
                    input_octets = usage_aggregates.input_octets + EXCLUDED.input_octets,
                    output_octets = usage_aggregates.output_octets + EXCLUDED.output_octets,
                    session_time = usage_aggregates.session_time + EXCLUDED.session_time,
                    session_count = usage_aggregates.session_count + EXCLUDED.session_count,
                    updated_utc = NOW()
                "#,
            )
            .bind(subscription_id)
            .bind(usage_date)
            .bind(input_octets)
            .bind(output_octets)
            .bind(session_time)
            .bind(result.folded_rows as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_error("increment usage aggregate"))?;

            result.added_octets = input_octets.saturating_add(output_octets);

            sqlx::query(
                r#"
                UPDATE subscriptions
                SET used_quota_bytes = used_quota_bytes + $2, updated_utc = NOW()
                WHERE subscription_id = $1
                "#,
            )
            .bind(subscription_id)
            .bind(result.added_octets)
            .execute(&mut *tx)
            .await
            .map_err(db_error("increment used quota"))?;
        }

        tx.commit().await.map_err(db_error("commit usage fold"))?;

        timer.observe_duration();
        Ok(result)
    }

    #[instrument(skip(self, range))]
    async fn list_usage(
        &self,
        subscription_id: Uuid,
        range: &UsageRange,
    ) -> Result<Vec<UsageAggregate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageAggregate>(
            r#"
            SELECT subscription_id, usage_date, input_octets, output_octets, session_time, session_count, updated_utc
            FROM usage_aggregates
            WHERE subscription_id = $1
              AND ($2::date IS NULL OR usage_date >= $2)
              AND ($3::date IS NULL OR usage_date <= $3)
            ORDER BY usage_date
            "#,
        )
        .bind(subscription_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list usage"))?;

        timer.observe_duration();
        Ok(rows)
    }

    async fn get_watermark(&self, name: &str) -> Result<Option<String>, AppError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM engine_watermarks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("read watermark"))
    }

    #[instrument(skip(self))]
    async fn set_watermark(&self, name: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO engine_watermarks (name, value) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value, updated_utc = NOW()
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_error("write watermark"))?;
        Ok(())
    }

    // =========================================================================
    // Invoices and payments
    // =========================================================================

    #[instrument(skip(self, input), fields(subscription_id = %input.subscription_id))]
    async fn issue_invoice(&self, input: &IssueInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["issue_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let current = sqlx::query_as::<_, (String, NaiveDate)>(
            "SELECT status, next_billing_date FROM subscriptions WHERE subscription_id = $1 FOR UPDATE",
        )
        .bind(input.subscription_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock subscription"))?;

        match current {
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    input.subscription_id
                )))
            }
            Some((status, next_billing_date))
                if status != "active" || next_billing_date > input.issue_date =>
            {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Subscription {} is no longer due for billing",
                    input.subscription_id
                )));
            }
            Some(_) => {}
        }

        let seq = next_sequence(&mut tx, &input.number_prefix, "invoices", "invoice_number").await?;
        let invoice_number = crate::models::format_document_number(&input.number_prefix, seq);

        let query = format!(
            r#"
            INSERT INTO invoices (invoice_id, invoice_number, customer_id, subscription_id, status,
                currency, issue_date, due_date, total_amount, paid_amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(Uuid::new_v4())
            .bind(&invoice_number)
            .bind(input.customer_id)
            .bind(input.subscription_id)
            .bind(InvoiceStatus::Sent.as_str())
            .bind(&input.currency)
            .bind(input.issue_date)
            .bind(input.due_date)
            .bind(input.amount)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("create invoice"))?;

        sqlx::query(
            r#"
            INSERT INTO invoice_items (item_id, invoice_id, subscription_id, description, quantity,
                unit_price, line_total, period_start, period_end)
            VALUES ($1, $2, $3, $4, 1, $5, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice.invoice_id)
        .bind(input.subscription_id)
        .bind(&input.description)
        .bind(input.amount)
        .bind(input.period_start)
        .bind(input.period_end)
        .execute(&mut *tx)
        .await
        .map_err(db_error("create invoice item"))?;

        sqlx::query(
            "UPDATE subscriptions SET next_billing_date = $2, updated_utc = NOW() WHERE subscription_id = $1",
        )
        .bind(input.subscription_id)
        .bind(input.next_billing_date)
        .execute(&mut *tx)
        .await
        .map_err(db_error("advance billing date"))?;

        tx.commit().await.map_err(db_error("commit invoice"))?;

        timer.observe_duration();
        info!(invoice_number = %invoice.invoice_number, "Invoice issued");

        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let query = format!("SELECT {} FROM invoices WHERE invoice_id = $1", INVOICE_COLUMNS);
        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get invoice"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn list_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT item_id, invoice_id, subscription_id, description, quantity, unit_price, line_total, period_start, period_end
            FROM invoice_items WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list invoice items"))
    }

    #[instrument(skip(self))]
    async fn list_customer_invoices(&self, customer_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customer_invoices"])
            .start_timer();

        let query = format!(
            "SELECT {} FROM invoices WHERE customer_id = $1 ORDER BY issue_date DESC, invoice_number DESC",
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Invoice>(&query)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list customer invoices"))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_invoices_due_on(&self, due_date: NaiveDate) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices_due_on"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {} FROM invoices
            WHERE status = 'sent' AND due_date = $1 AND total_amount > paid_amount
            ORDER BY invoice_number
            "#,
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Invoice>(&query)
            .bind(due_date)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list invoices due"))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_past_due_invoices(&self, as_of: NaiveDate) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_past_due_invoices"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {} FROM invoices
            WHERE status IN ('sent', 'partially_paid', 'overdue') AND due_date < $1
              AND total_amount > paid_amount
            ORDER BY due_date, invoice_number
            "#,
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Invoice>(&query)
            .bind(as_of)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list past due invoices"))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn mark_invoice_overdue(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_overdue"])
            .start_timer();

        // Guarded so a payment that settled the invoice after it was listed wins.
        let query = format!(
            r#"
            UPDATE invoices SET status = 'overdue', updated_utc = NOW()
            WHERE invoice_id = $1
              AND status IN ('sent', 'partially_paid', 'overdue')
              AND paid_amount < total_amount
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, Invoice>(&query)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("mark invoice overdue"))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id, amount = %input.amount))]
    async fn record_payment(&self, input: &RecordPayment) -> Result<RecordedPayment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let query = format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        );
        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(input.invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("lock invoice"))?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", input.invoice_id))
            })?;

        check_payment(&invoice, input.amount)?;

        let seq = next_sequence(&mut tx, &input.number_prefix, "payments", "payment_number").await?;
        let payment_number = crate::models::format_document_number(&input.number_prefix, seq);

        let query = format!(
            r#"
            INSERT INTO payments (payment_id, payment_number, invoice_id, customer_id, amount,
                currency, method, status, reference, payment_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'completed', $8, $9)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(Uuid::new_v4())
            .bind(&payment_number)
            .bind(invoice.invoice_id)
            .bind(invoice.customer_id)
            .bind(input.amount)
            .bind(&invoice.currency)
            .bind(input.method.as_str())
            .bind(&input.reference)
            .bind(input.payment_date)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("create payment"))?;

        let paid_amount = invoice.paid_amount + input.amount;
        let status = InvoiceStatus::derive(
            paid_amount,
            invoice.total_amount,
            invoice.due_date,
            input.payment_date,
        );

        let query = format!(
            r#"
            UPDATE invoices SET paid_amount = $2, status = $3, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(invoice.invoice_id)
            .bind(paid_amount)
            .bind(status.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("apply payment to invoice"))?;

        tx.commit().await.map_err(db_error("commit payment"))?;

        timer.observe_duration();
        info!(
            payment_number = %payment.payment_number,
            invoice_number = %invoice.invoice_number,
            status = %invoice.status,
            "Payment recorded"
        );

        Ok(RecordedPayment { payment, invoice })
    }

    // =========================================================================
    // Job leases
    // =========================================================================

    #[instrument(skip(self))]
    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_leases (job, holder, expires_utc)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (job) DO UPDATE SET holder = EXCLUDED.holder, expires_utc = EXCLUDED.expires_utc
            WHERE job_leases.expires_utc < NOW() OR job_leases.holder = EXCLUDED.holder
            "#,
        )
        .bind(job)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_error("acquire job lease"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM job_leases WHERE job = $1 AND holder = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_error("release job lease"))?;
        Ok(())
    }
}

/// Read access to the RADIUS accounting and NAS tables.
#[derive(Clone)]
pub struct RadiusDatabase {
    pool: PgPool,
}

impl RadiusDatabase {
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        let pool = connect(database_url, max_connections, min_connections).await?;
        info!("RADIUS database pool established");
        Ok(Self { pool })
    }

    /// Share an existing pool when RADIUS tables live in the main database.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountingSource for RadiusDatabase {
    #[instrument(skip(self))]
    async fn completed_sessions_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<AccountingRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["completed_sessions_since"])
            .start_timer();

        let rows = sqlx::query_as::<_, AccountingRecord>(
            r#"
            SELECT acctuniqueid AS unique_id, acctsessionid AS session_id, username,
                   nasipaddress AS nas_address, framedipaddress AS framed_ip,
                   acctstarttime AS start_time, acctstoptime AS stop_time,
                   acctinputoctets AS input_octets, acctoutputoctets AS output_octets,
                   acctsessiontime AS session_time
            FROM radacct
            WHERE acctstoptime IS NOT NULL
              AND ($1::timestamptz IS NULL OR acctstarttime > $1 OR acctstoptime > $1)
            ORDER BY acctstoptime, radacctid
            "#,
        )
        .bind(watermark)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read accounting rows"))?;

        timer.observe_duration();
        Ok(rows)
    }
}

#[async_trait]
impl SessionDirectory for RadiusDatabase {
    #[instrument(skip(self))]
    async fn find_active_session(
        &self,
        username: &str,
    ) -> Result<Option<ActiveSession>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_active_session"])
            .start_timer();

        let session = sqlx::query_as::<_, ActiveSession>(
            r#"
            SELECT nasipaddress AS nas_address, acctsessionid AS session_id, framedipaddress AS framed_ip
            FROM radacct
            WHERE username = $1 AND acctstoptime IS NULL
            ORDER BY acctstarttime DESC
            LIMIT 1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("look up active session"))?;

        timer.observe_duration();
        Ok(session)
    }

    async fn find_nas(&self, nas_address: &str) -> Result<Option<NasDevice>, AppError> {
        let device = sqlx::query_as::<_, NasDevice>(
            "SELECT nasname AS nas_address, secret, coa_port FROM nas WHERE nasname = $1",
        )
        .bind(nas_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("look up NAS"))?;

        if device.is_none() {
            warn!(nas_address = %nas_address, "NAS not registered");
        }
        Ok(device)
    }
}
