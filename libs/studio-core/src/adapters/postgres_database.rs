use crate::domain::attendance::{Attendance, AttendanceFilter};
use crate::domain::class::{Class, Package, Schedule};
use crate::domain::notification::Notification;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::request::{ClassRequest, RequestFilter, RequestStatus};
use crate::domain::user::{User, UserFilter};
use crate::{
    AttendanceRepository, ClassRepository, CoreError, DatabaseConnector, NotificationRepository,
    PaymentRepository, RequestRepository, TenantDatabase, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const UNIQUE_VIOLATION: &str = "23505";
const DUPLICATE_DATABASE: &str = "42P04";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        admin_id TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS classes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        instructor TEXT NOT NULL,
        days TEXT[] NOT NULL,
        time TEXT NOT NULL,
        duration INTEGER NOT NULL,
        capacity INTEGER NOT NULL,
        mode TEXT NOT NULL,
        location TEXT,
        meeting_link TEXT,
        enrolled TEXT[] NOT NULL DEFAULT '{}',
        packages JSONB NOT NULL,
        is_active BOOLEAN NOT NULL,
        created_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS class_requests (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        class_id TEXT NOT NULL,
        package_type TEXT NOT NULL,
        status TEXT NOT NULL,
        request_date TIMESTAMPTZ NOT NULL,
        response_date TIMESTAMPTZ,
        auto_reject_date TIMESTAMPTZ NOT NULL,
        payment_id TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS class_requests_one_pending
        ON class_requests (user_id, class_id) WHERE status = 'pending'",
    "CREATE TABLE IF NOT EXISTS attendance (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        class_id TEXT NOT NULL,
        date TIMESTAMPTZ NOT NULL,
        day DATE NOT NULL,
        status TEXT NOT NULL,
        marked_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (user_id, class_id, day)
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        class_id TEXT NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        package_type TEXT NOT NULL,
        status TEXT NOT NULL,
        payment_method TEXT NOT NULL,
        transaction_id TEXT NOT NULL UNIQUE,
        receipt_number TEXT NOT NULL UNIQUE,
        valid_from TIMESTAMPTZ NOT NULL,
        valid_until TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        recipient TEXT NOT NULL,
        sender TEXT NOT NULL,
        kind TEXT NOT NULL,
        message TEXT NOT NULL,
        related_class TEXT,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS notifications_recipient ON notifications (recipient, created_at DESC)",
];

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn db_err(err: sqlx::Error) -> CoreError {
    CoreError::infrastructure(err)
}

// --- Row mapping ---

fn user_from_row(row: &PgRow) -> Result<User, CoreError> {
    let role: String = row.try_get("role").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(User {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        email: row.try_get("email").map_err(db_err)?,
        password_hash: row.try_get("password_hash").map_err(db_err)?,
        role: role.parse().map_err(CoreError::from)?,
        status: status.parse().map_err(CoreError::from)?,
        admin_id: row.try_get("admin_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn class_from_row(row: &PgRow) -> Result<Class, CoreError> {
    let mode: String = row.try_get("mode").map_err(db_err)?;
    let duration: i32 = row.try_get("duration").map_err(db_err)?;
    let capacity: i32 = row.try_get("capacity").map_err(db_err)?;
    let packages: Json<Vec<Package>> = row.try_get("packages").map_err(db_err)?;
    Ok(Class {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        instructor: row.try_get("instructor").map_err(db_err)?,
        schedule: Schedule {
            days: row.try_get("days").map_err(db_err)?,
            time: row.try_get("time").map_err(db_err)?,
            duration: duration.max(0) as u32,
        },
        capacity: capacity.max(0) as u32,
        mode: mode.parse().map_err(CoreError::from)?,
        location: row.try_get("location").map_err(db_err)?,
        meeting_link: row.try_get("meeting_link").map_err(db_err)?,
        enrolled: row.try_get("enrolled").map_err(db_err)?,
        packages: packages.0,
        is_active: row.try_get("is_active").map_err(db_err)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn request_from_row(row: &PgRow) -> Result<ClassRequest, CoreError> {
    let package: String = row.try_get("package_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(ClassRequest {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        class_id: row.try_get("class_id").map_err(db_err)?,
        package_type: package.parse()?,
        status: status.parse()?,
        request_date: row.try_get("request_date").map_err(db_err)?,
        response_date: row.try_get("response_date").map_err(db_err)?,
        auto_reject_date: row.try_get("auto_reject_date").map_err(db_err)?,
        payment_id: row.try_get("payment_id").map_err(db_err)?,
    })
}

fn attendance_from_row(row: &PgRow) -> Result<Attendance, CoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Attendance {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        class_id: row.try_get("class_id").map_err(db_err)?,
        date: row.try_get("date").map_err(db_err)?,
        day: row.try_get("day").map_err(db_err)?,
        status: status.parse()?,
        marked_by: row.try_get("marked_by").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, CoreError> {
    let package: String = row.try_get("package_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Payment {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        class_id: row.try_get("class_id").map_err(db_err)?,
        amount: row.try_get("amount").map_err(db_err)?,
        package_type: package.parse()?,
        status: status.parse()?,
        payment_method: row.try_get("payment_method").map_err(db_err)?,
        transaction_id: row.try_get("transaction_id").map_err(db_err)?,
        receipt_number: row.try_get("receipt_number").map_err(db_err)?,
        valid_from: row.try_get("valid_from").map_err(db_err)?,
        valid_until: row.try_get("valid_until").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, CoreError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    Ok(Notification {
        id: row.try_get("id").map_err(db_err)?,
        recipient: row.try_get("recipient").map_err(db_err)?,
        sender: row.try_get("sender").map_err(db_err)?,
        kind: kind.parse()?,
        message: row.try_get("message").map_err(db_err)?,
        related_class: row.try_get("related_class").map_err(db_err)?,
        is_read: row.try_get("is_read").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> Result<T, CoreError>) -> Result<Vec<T>, CoreError> {
    rows.iter().map(map).collect()
}

/// One tenant database on a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    name: String,
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(name: &str, pool: PgPool) -> Self {
        Self {
            name: name.to_string(),
            pool,
        }
    }

    /// Creates missing tables and indexes. Safe to run on every connect.
    pub async fn bootstrap(&self) -> Result<(), CoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        debug!(database = %self.name, "Schema ready");
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PostgresDatabase {
    async fn insert_user(&self, user: User) -> Result<User, CoreError> {
        let result = sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, status, admin_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(&user.admin_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(user),
            Err(e) if is_unique_violation(&e) => Err(CoreError::Conflict(format!(
                "User already exists: {}",
                user.email
            ))),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
        sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn list_users(&self, filter: &UserFilter) -> Result<Vec<User>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM users
             WHERE ($1::TEXT IS NULL OR role = $1)
               AND ($2::TEXT IS NULL OR admin_id = $2)
             ORDER BY created_at",
        )
        .bind(filter.role.map(|r| r.as_str()))
        .bind(filter.admin_id.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, user_from_row)
    }

    async fn update_user(&self, user: &User) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE users SET name = $2, status = $3, admin_id = $4, password_hash = $5
             WHERE id = $1",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(user.status.as_str())
        .bind(&user.admin_id)
        .bind(&user.password_hash)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User not found: {}", user.id)));
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ClassRepository for PostgresDatabase {
    async fn insert_class(&self, class: Class) -> Result<Class, CoreError> {
        sqlx::query(
            "INSERT INTO classes (id, name, description, instructor, days, time, duration,
                capacity, mode, location, meeting_link, enrolled, packages, is_active,
                created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(&class.id)
        .bind(&class.name)
        .bind(&class.description)
        .bind(&class.instructor)
        .bind(&class.schedule.days)
        .bind(&class.schedule.time)
        .bind(class.schedule.duration as i32)
        .bind(class.capacity as i32)
        .bind(class.mode.as_str())
        .bind(&class.location)
        .bind(&class.meeting_link)
        .bind(&class.enrolled)
        .bind(Json(&class.packages))
        .bind(class.is_active)
        .bind(&class.created_by)
        .bind(class.created_at)
        .bind(class.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(class)
    }

    async fn get_class(&self, class_id: &str) -> Result<Option<Class>, CoreError> {
        sqlx::query("SELECT * FROM classes WHERE id = $1")
            .bind(class_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(class_from_row)
            .transpose()
    }

    async fn list_classes(&self, active_only: bool) -> Result<Vec<Class>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM classes WHERE (NOT $1 OR is_active) ORDER BY created_at DESC",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, class_from_row)
    }

    async fn update_class(&self, class: &Class) -> Result<(), CoreError> {
        // `enrolled` is left alone; it only changes through the set operations.
        let result = sqlx::query(
            "UPDATE classes SET name = $2, description = $3, instructor = $4, days = $5,
                time = $6, duration = $7, capacity = $8, mode = $9, location = $10,
                meeting_link = $11, packages = $12, is_active = $13, updated_at = $14
             WHERE id = $1",
        )
        .bind(&class.id)
        .bind(&class.name)
        .bind(&class.description)
        .bind(&class.instructor)
        .bind(&class.schedule.days)
        .bind(&class.schedule.time)
        .bind(class.schedule.duration as i32)
        .bind(class.capacity as i32)
        .bind(class.mode.as_str())
        .bind(&class.location)
        .bind(&class.meeting_link)
        .bind(Json(&class.packages))
        .bind(class.is_active)
        .bind(class.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Class not found: {}", class.id)));
        }
        Ok(())
    }

    async fn add_enrolled(&self, class_id: &str, user_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE classes SET enrolled = array_append(enrolled, $2)
             WHERE id = $1 AND NOT ($2 = ANY(enrolled))",
        )
        .bind(class_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_class(class_id).await? {
            Some(_) => Ok(false),
            None => Err(CoreError::NotFound(format!("Class not found: {class_id}"))),
        }
    }

    async fn remove_enrolled_everywhere(&self, user_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE classes SET enrolled = array_remove(enrolled, $1) WHERE $1 = ANY(enrolled)",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RequestRepository for PostgresDatabase {
    async fn insert_pending(&self, request: ClassRequest) -> Result<ClassRequest, CoreError> {
        let result = sqlx::query(
            "INSERT INTO class_requests (id, user_id, class_id, package_type, status,
                request_date, response_date, auto_reject_date, payment_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(&request.class_id)
        .bind(request.package_type.as_str())
        .bind(RequestStatus::Pending.as_str())
        .bind(request.request_date)
        .bind(request.response_date)
        .bind(request.auto_reject_date)
        .bind(&request.payment_id)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(request),
            Err(e) if is_unique_violation(&e) => Err(CoreError::Conflict(
                "A pending request for this class already exists".into(),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<ClassRequest>, CoreError> {
        sqlx::query("SELECT * FROM class_requests WHERE id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(request_from_row)
            .transpose()
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<ClassRequest>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM class_requests
             WHERE ($1::TEXT IS NULL OR status = $1)
               AND ($2::TEXT IS NULL OR user_id = $2)
               AND ($3::TEXT IS NULL OR class_id = $3)
             ORDER BY request_date DESC",
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.user_id.as_deref())
        .bind(filter.class_id.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, request_from_row)
    }

    async fn transition_request(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<ClassRequest>, CoreError> {
        sqlx::query(
            "UPDATE class_requests SET status = $3, response_date = $4
             WHERE id = $1 AND status = $2
             RETURNING *",
        )
        .bind(request_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(request_from_row)
        .transpose()
    }

    async fn link_payment(&self, request_id: &str, payment_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE class_requests SET payment_id = $2 WHERE id = $1")
            .bind(request_id)
            .bind(payment_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Request not found: {request_id}")));
        }
        Ok(())
    }

    async fn delete_requests_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM class_requests WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AttendanceRepository for PostgresDatabase {
    async fn upsert_attendance(&self, record: Attendance) -> Result<Attendance, CoreError> {
        let row = sqlx::query(
            "INSERT INTO attendance (id, user_id, class_id, date, day, status, marked_by,
                created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (user_id, class_id, day) DO UPDATE SET
                status = EXCLUDED.status,
                marked_by = EXCLUDED.marked_by,
                date = EXCLUDED.date,
                updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.class_id)
        .bind(record.date)
        .bind(record.day)
        .bind(record.status.as_str())
        .bind(&record.marked_by)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        attendance_from_row(&row)
    }

    async fn list_attendance(
        &self,
        filter: &AttendanceFilter,
    ) -> Result<Vec<Attendance>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM attendance
             WHERE ($1::TEXT IS NULL OR user_id = $1)
               AND ($2::TEXT IS NULL OR class_id = $2)
             ORDER BY day DESC, date DESC",
        )
        .bind(filter.user_id.as_deref())
        .bind(filter.class_id.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, attendance_from_row)
    }

    async fn delete_attendance_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM attendance WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentRepository for PostgresDatabase {
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, CoreError> {
        sqlx::query(
            "INSERT INTO payments (id, user_id, class_id, amount, package_type, status,
                payment_method, transaction_id, receipt_number, valid_from, valid_until, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&payment.id)
        .bind(&payment.user_id)
        .bind(&payment.class_id)
        .bind(payment.amount)
        .bind(payment.package_type.as_str())
        .bind(payment.status.as_str())
        .bind(&payment.payment_method)
        .bind(&payment.transaction_id)
        .bind(&payment.receipt_number)
        .bind(payment.valid_from)
        .bind(payment.valid_until)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, CoreError> {
        sqlx::query("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }

    async fn list_payments_for_user(&self, user_id: &str) -> Result<Vec<Payment>, CoreError> {
        let rows = sqlx::query("SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        collect(rows, payment_from_row)
    }

    async fn refund_payment(&self, payment_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE payments SET status = $2 WHERE id = $1 AND status <> $2")
            .bind(payment_id)
            .bind(PaymentStatus::Refunded.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn refund_payments_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let result =
            sqlx::query("UPDATE payments SET status = $2 WHERE user_id = $1 AND status <> $2")
                .bind(user_id)
                .bind(PaymentStatus::Refunded.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NotificationRepository for PostgresDatabase {
    async fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for n in notifications {
            sqlx::query(
                "INSERT INTO notifications (id, recipient, sender, kind, message, related_class,
                    is_read, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&n.id)
            .bind(&n.recipient)
            .bind(&n.sender)
            .bind(n.kind.as_str())
            .bind(&n.message)
            .bind(&n.related_class)
            .bind(n.is_read)
            .bind(n.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE recipient = $1 ORDER BY created_at DESC",
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, notification_from_row)
    }

    async fn mark_notification_read(
        &self,
        notification_id: &str,
        recipient: &str,
    ) -> Result<Option<Notification>, CoreError> {
        sqlx::query(
            "UPDATE notifications SET is_read = TRUE
             WHERE id = $1 AND recipient = $2
             RETURNING *",
        )
        .bind(notification_id)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(notification_from_row)
        .transpose()
    }

    async fn delete_notifications_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE recipient = $1 OR sender = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TenantDatabase for PostgresDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens one pool per tenant database on a single server, creating the
/// database on first use.
pub struct PostgresConnector {
    base: PgConnectOptions,
    admin: PgPool,
    max_connections: u32,
}

impl PostgresConnector {
    /// `database_url` points at any database the role may connect to; it is
    /// only used to create tenant databases.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let base = PgConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::Configuration(format!("Invalid DATABASE_URL: {}", e)))?;
        let admin = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(base.clone())
            .await
            .map_err(db_err)?;
        info!("Postgres server reachable");
        Ok(Self {
            base,
            admin,
            max_connections,
        })
    }

    async fn ensure_database(&self, database_name: &str) -> Result<(), CoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(database_name)
                .fetch_one(&self.admin)
                .await
                .map_err(db_err)?;
        if exists {
            return Ok(());
        }

        // Identifiers cannot be bound; the name only contains [A-Za-z0-9_-].
        let create = format!("CREATE DATABASE \"{database_name}\"");
        match sqlx::query(&create).execute(&self.admin).await {
            Ok(_) => {
                info!(database = %database_name, "Created tenant database");
                Ok(())
            }
            // Another process created it first.
            Err(sqlx::Error::Database(e))
                if matches!(e.code().as_deref(), Some(DUPLICATE_DATABASE) | Some(UNIQUE_VIOLATION)) =>
            {
                Ok(())
            }
            Err(e) => Err(db_err(e)),
        }
    }
}

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    async fn connect(&self, database_name: &str) -> Result<Arc<dyn TenantDatabase>, CoreError> {
        self.ensure_database(database_name).await?;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(self.base.clone().database(database_name))
            .await
            .map_err(db_err)?;
        let db = PostgresDatabase::new(database_name, pool);
        db.bootstrap().await?;
        Ok(Arc::new(db))
    }
}
