use crate::domain::class::PackageType;
use crate::domain::request::{RequestFilter, RequestStatus};
use crate::domain::user::{Role, User};
use crate::tenancy::TenantScope;
use crate::{Command, CommandHandler, CoreError};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(CoreError::Validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: String,
    pub user_id: String,
    pub class_id: String,
    pub amount: f64,
    pub package_type: PackageType,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub transaction_id: String,
    pub receipt_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Calendar-aware validity. Month ends clamp, so Jan 31 + 1 month is the last
/// day of February and Feb 29 + 1 year is Feb 28.
pub fn validity_window(
    package: PackageType,
    from: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let months = match package {
        PackageType::ThreeMonth => Months::new(3),
        PackageType::OneYear => Months::new(12),
    };
    let until = from
        .checked_add_months(months)
        .ok_or_else(|| CoreError::Validation("validity window out of range".into()))?;
    Ok((from, until))
}

pub struct Receipt {
    pub receipt_number: String,
    pub transaction_id: String,
}

/// Issues receipt numbers that are unique within the process: a millisecond
/// timestamp that never repeats or goes backwards.
pub struct ReceiptIssuer {
    prefix: String,
    last: AtomicI64,
}

impl ReceiptIssuer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            last: AtomicI64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn next(&self, now: DateTime<Utc>) -> Receipt {
        let wanted = now.timestamp_millis();
        let mut current = self.last.load(Ordering::Relaxed);
        let stamp = loop {
            let candidate = wanted.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(observed) => current = observed,
            }
        };
        Receipt {
            receipt_number: format!("{}-{}", self.prefix, stamp),
            transaction_id: format!("TXN-{stamp}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessPayment {
    pub actor: User,
    pub class_id: String,
    pub package: PackageType,
    pub payment_method: String,
    pub now: DateTime<Utc>,
}

impl Command for ProcessPayment {}

pub struct PaymentIssuer {
    scope: TenantScope,
    receipts: Arc<ReceiptIssuer>,
}

impl PaymentIssuer {
    pub fn new(scope: TenantScope, receipts: Arc<ReceiptIssuer>) -> Self {
        Self { scope, receipts }
    }

    /// Another user's payment is reported as missing, not forbidden.
    pub async fn receipt(&self, actor: &User, payment_id: &str) -> Result<Payment, CoreError> {
        self.scope
            .db
            .get_payment(payment_id)
            .await?
            .filter(|p| p.user_id == actor.id)
            .ok_or_else(|| CoreError::NotFound(format!("Payment not found: {payment_id}")))
    }

    pub async fn list_own(&self, actor: &User) -> Result<Vec<Payment>, CoreError> {
        self.scope.db.list_payments_for_user(&actor.id).await
    }
}

impl CommandHandler<ProcessPayment> for PaymentIssuer {
    type Output = Payment;

    async fn handle(&self, command: ProcessPayment) -> Result<Payment, CoreError> {
        if command.actor.role != Role::User {
            return Err(CoreError::Forbidden("only users can pay for classes".into()));
        }
        let method = command.payment_method.trim();
        if method.is_empty() {
            return Err(CoreError::Validation("payment method is required".into()));
        }
        let class = self
            .scope
            .db
            .get_class(&command.class_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| CoreError::NotFound(format!("Class not found: {}", command.class_id)))?;
        let amount = class.price_of(command.package).ok_or_else(|| {
            CoreError::Validation(format!(
                "class does not offer the {} package",
                command.package.as_str()
            ))
        })?;

        let (valid_from, valid_until) = validity_window(command.package, command.now)?;
        let receipt = self.receipts.next(command.now);
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            user_id: command.actor.id.clone(),
            class_id: class.id.clone(),
            amount,
            package_type: command.package,
            status: PaymentStatus::Completed,
            payment_method: method.to_string(),
            transaction_id: receipt.transaction_id,
            receipt_number: receipt.receipt_number,
            valid_from,
            valid_until,
            created_at: command.now,
        };
        let payment = self.scope.db.insert_payment(payment).await?;
        info!(
            tenant = %self.scope.tenant,
            payment_id = %payment.id,
            receipt = %payment.receipt_number,
            "Payment completed"
        );

        let filter = RequestFilter {
            status: Some(RequestStatus::Pending),
            user_id: Some(command.actor.id.clone()),
            class_id: Some(class.id.clone()),
        };
        let latest = self
            .scope
            .db
            .list_requests(&filter)
            .await?
            .into_iter()
            .max_by_key(|r| r.request_date);
        if let Some(request) = latest {
            self.scope.db.link_payment(&request.id, &payment.id).await?;
        }
        Ok(payment)
    }
}
