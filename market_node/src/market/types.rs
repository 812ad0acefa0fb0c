use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::payout::{PayoutDetails, Recipient, Settlement};

pub type UserId = Uuid;
pub type ScenarioId = u64;
pub type OrderId = u64;

/// WGS84 coordinate. Serialized as `{"lat", "lng"}`; also read from and
/// displayed as WKT `POINT(lng lat)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "POINT({} {})", self.lng, self.lat)
    }
}

impl FromStr for GeoPoint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("expected POINT(lng lat), got {value:?}");
        let inner = value
            .trim()
            .strip_prefix("POINT(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let coords: Vec<f64> = inner
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| invalid())?;
        match coords[..] {
            [lng, lat] => Ok(Self { lat, lng }),
            _ => Err(invalid()),
        }
    }
}

impl<'de> Deserialize<'de> for GeoPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Object { lat: f64, lng: f64 },
            Wkt(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Object { lat, lng } => Ok(Self { lat, lng }),
            Repr::Wkt(wkt) => wkt.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PendingExecution,
    PaidPendingExecution,
    InProgress,
    CompletedPendingApproval,
    Completed,
    Expired,
    Cancelled,
    Disputed,
}

impl OrderStatus {
    pub const PENDING_STATES: [OrderStatus; 3] = [
        OrderStatus::Pending,
        OrderStatus::PendingExecution,
        OrderStatus::PaidPendingExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PendingExecution => "pending_execution",
            OrderStatus::PaidPendingExecution => "paid_pending_execution",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::CompletedPendingApproval => "completed_pending_approval",
            OrderStatus::Completed => "completed",
            OrderStatus::Expired => "expired",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Disputed => "disputed",
        }
    }

    pub fn is_pending(&self) -> bool {
        Self::PENDING_STATES.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Expired | OrderStatus::Cancelled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub role: Option<String>,
    pub wallet: Option<String>,
    pub location: Option<GeoPoint>,
    pub is_location_public: bool,
    pub referral_code: String,
    pub invited_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(id: UserId, referral_code: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            display_name: None,
            avatar_url: None,
            bio: None,
            role: None,
            wallet: None,
            location: None,
            is_location_public: false,
            referral_code,
            invited_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// What other users get to see
    pub fn to_public(&self) -> PublicProfile {
        PublicProfile {
            id: self.id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            bio: self.bio.clone(),
            role: self.role.clone(),
            location: if self.is_location_public {
                self.location
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub role: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub creator_id: UserId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteSide {
    Performer,
    Customer,
}

impl fmt::Display for VoteSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteSide::Performer => f.write_str("performer"),
            VoteSide::Customer => f.write_str("customer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeVote {
    pub order_id: OrderId,
    pub voter_id: UserId,
    pub vote_side: VoteSide,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: VoteSide,
    pub performer_votes: u32,
    pub customer_votes: u32,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub scenario_id: ScenarioId,
    pub customer_id: UserId,
    pub performer_id: UserId,
    pub status: OrderStatus,
    pub execution_time: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub transaction_hash: Option<String>,
    pub payout_details: Option<PayoutDetails>,
    pub dispute_started_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub settlement: Option<Settlement>,
    pub version: u64,
    pub status_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_party(&self, user: &UserId) -> bool {
        self.customer_id == *user || self.performer_id == *user
    }

    pub fn is_paid(&self) -> bool {
        self.transaction_hash.is_some()
    }

    /// What people outside the order get to see: no wallets, no referrer,
    /// no meeting point
    pub fn to_public(&self) -> Order {
        let mut order = self.clone();
        order.location = None;
        if let Some(details) = order.payout_details.as_mut() {
            details.referrer_id = None;
        }
        if let Some(settlement) = order.settlement.as_mut() {
            for leg in &mut settlement.legs {
                leg.wallet = None;
                if leg.recipient == Recipient::Referrer {
                    leg.user_id = None;
                }
            }
        }
        order
    }
}

/// Order fields supplied at insert time; the store assigns id and version
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub customer_id: UserId,
    pub performer_id: UserId,
    pub status: OrderStatus,
    pub execution_time: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub transaction_hash: Option<String>,
    pub payout_details: Option<PayoutDetails>,
}

#[derive(Debug, Clone)]
pub struct ScenarioDraft {
    pub creator_id: UserId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
}
