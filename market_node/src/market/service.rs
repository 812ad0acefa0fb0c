//! Marketplace operations.
//!
//! [`MarketService`] owns every write: it validates input, enforces ownership
//! and the order state machine, verifies payments, persists through
//! [`MarketStore`] and publishes change events.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::dispute::{DisputeRules, DisputeTally, DEFAULT_DISPUTE_HOURS, DEFAULT_WIN_THRESHOLD};
use super::error::{MarketError, MarketResult};
use super::order_lifecycle::{transition, Actor, OrderAction};
use super::payout::{payout_settlement, refund_settlement, PayoutSplit, PayoutWallets, Settlement};
use super::types::{
    DisputeVote, GeoPoint, Order, OrderDraft, OrderId, OrderStatus, Profile, PublicProfile,
    Resolution, Scenario, ScenarioDraft, ScenarioId, UserId, VoteSide,
};
use super::validation;
use crate::events::{EventManager, Table};
use crate::payment::{PaymentCheck, PaymentVerifier, SettlementExecutor};
use crate::storage::{MarketStore, ObjectStore};

pub const AVATAR_BUCKET: &str = "avatars";
const AVATAR_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketRules {
    pub win_threshold: u32,
    pub dispute_window_hours: i64,
    pub approval_window_hours: i64,
    pub expiry_grace_minutes: i64,
    pub schedule_tolerance_minutes: i64,
    pub max_schedule_days: i64,
}

impl Default for MarketRules {
    fn default() -> Self {
        Self {
            win_threshold: DEFAULT_WIN_THRESHOLD,
            dispute_window_hours: DEFAULT_DISPUTE_HOURS,
            approval_window_hours: 72,
            expiry_grace_minutes: 60,
            schedule_tolerance_minutes: 5,
            max_schedule_days: 365,
        }
    }
}

impl MarketRules {
    pub fn dispute_rules(&self) -> DisputeRules {
        DisputeRules {
            win_threshold: self.win_threshold,
            window: Duration::hours(self.dispute_window_hours),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub bio: Option<String>,
    /// Empty string clears the wallet
    pub wallet: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewScenario {
    pub title: String,
    pub description: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub performer_id: UserId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub execution_time: DateTime<Utc>,
    pub location: GeoPoint,
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub execution_time: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTab {
    #[default]
    All,
    /// In progress
    Active,
    /// Completed or expired
    Completed,
}

impl OrderTab {
    fn includes(&self, status: OrderStatus) -> bool {
        match self {
            OrderTab::All => true,
            OrderTab::Active => status == OrderStatus::InProgress,
            OrderTab::Completed => {
                matches!(status, OrderStatus::Completed | OrderStatus::Expired)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioWithCreator {
    pub id: ScenarioId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub creator_id: UserId,
    pub creator_name: Option<String>,
    pub creator_avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileCard {
    pub profile: PublicProfile,
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapUser {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
    pub lat: f64,
    pub lng: f64,
}

/// One order row as seen by one of its parties
#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub order_status: OrderStatus,
    pub execution_time: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub customer_id: UserId,
    pub performer_id: UserId,
    pub other_user_id: UserId,
    pub other_name: Option<String>,
    pub other_avatar: Option<String>,
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub scenario: Option<Scenario>,
    pub customer: Option<PublicProfile>,
    pub performer: Option<PublicProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeView {
    pub order: OrderView,
    pub performer_votes: u32,
    pub customer_votes: u32,
    pub performer_percent: f64,
    pub win_threshold: u32,
    pub ends_at: Option<DateTime<Utc>>,
    pub my_vote: Option<VoteSide>,
    pub can_vote: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub auto_approved: usize,
    pub disputes_resolved: usize,
}

pub struct MarketService {
    store: Arc<MarketStore>,
    events: Arc<EventManager>,
    verifier: Arc<dyn PaymentVerifier>,
    objects: Arc<dyn ObjectStore>,
    settlement: Option<Arc<SettlementExecutor>>,
    rules: MarketRules,
    split: PayoutSplit,
    amount_scale: u32,
    platform_wallet: Option<String>,
}

impl MarketService {
    pub fn new(
        store: Arc<MarketStore>,
        events: Arc<EventManager>,
        verifier: Arc<dyn PaymentVerifier>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            store,
            events,
            verifier,
            objects,
            settlement: None,
            rules: MarketRules::default(),
            split: PayoutSplit::default(),
            amount_scale: crate::payment::DEFAULT_TOKEN_DECIMALS,
            platform_wallet: None,
        }
    }

    pub fn with_rules(mut self, rules: MarketRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_settlement(mut self, executor: Arc<SettlementExecutor>) -> Self {
        self.settlement = Some(executor);
        self
    }

    pub fn with_platform_wallet(mut self, wallet: Option<String>) -> Self {
        self.platform_wallet = wallet;
        self
    }

    /// Decimal places kept when splitting prices; capped at what `Decimal` holds
    pub fn with_amount_scale(mut self, decimals: u32) -> Self {
        self.amount_scale = decimals.min(28);
        self
    }

    pub fn rules(&self) -> &MarketRules {
        &self.rules
    }

    pub fn store(&self) -> &Arc<MarketStore> {
        &self.store
    }

    // Profiles

    pub async fn get_profile(&self, user: &UserId) -> MarketResult<Profile> {
        self.store
            .get_profile(user)
            .await?
            .ok_or_else(|| MarketError::not_found("profile", user))
    }

    /// Apply `mutate` to the caller's profile, creating it on first write
    async fn write_profile<F>(&self, user: &UserId, mutate: F) -> MarketResult<Profile>
    where
        F: FnOnce(&mut Profile, bool) -> MarketResult<()>,
    {
        let referral_code = generate_referral_code();
        let (old, new) = self
            .store
            .upsert_profile::<_, MarketError>(user, |existing| {
                let (mut profile, created) = match existing {
                    Some(p) => (p.clone(), false),
                    None => (Profile::new(*user, referral_code, Utc::now()), true),
                };
                mutate(&mut profile, created)?;
                Ok(profile)
            })
            .await?;

        // the feed is unauthenticated, so it only carries the public form
        match &old {
            Some(old) => {
                self.events
                    .publish_update(Table::Profiles, &old.to_public(), &new.to_public())
            }
            None => {
                log::info!("Created profile {} (referral code {})", user, new.referral_code);
                self.events.publish_insert(Table::Profiles, &new.to_public());
            }
        }
        Ok(new)
    }

    pub async fn save_profile(&self, user: &UserId, update: ProfileUpdate) -> MarketResult<Profile> {
        let referrer = match update.referral_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let referrer = self
                    .store
                    .find_profile_by_referral_code(code)
                    .await?
                    .ok_or_else(|| MarketError::validation("referral_code", "unknown referral code"))?;
                if referrer.id == *user {
                    return Err(MarketError::validation(
                        "referral_code",
                        "cannot use your own referral code",
                    ));
                }
                Some(referrer.id)
            }
            _ => None,
        };

        let wallet = match update.wallet.as_deref().map(str::trim) {
            Some("") => Some(None),
            Some(address) => {
                validation::validate_address(address)?;
                Some(Some(address.to_string()))
            }
            None => None,
        };

        self.write_profile(user, move |profile, _| {
            if let Some(name) = update.display_name {
                profile.display_name = non_empty(name);
            }
            if let Some(role) = update.role {
                profile.role = non_empty(role);
            }
            if let Some(bio) = update.bio {
                profile.bio = non_empty(bio);
            }
            if let Some(wallet) = wallet {
                profile.wallet = wallet;
            }
            if profile.invited_by.is_none() {
                profile.invited_by = referrer;
            }
            Ok(())
        })
        .await
    }

    /// Store the image under `avatars/{user}/{uuid}.{ext}` and point the profile at it
    pub async fn upload_avatar(
        &self,
        user: &UserId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> MarketResult<String> {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| AVATAR_EXTENSIONS.contains(&ext.as_str()))
            .ok_or_else(|| {
                MarketError::validation("avatar", "expected a png, jpg, gif or webp image")
            })?;
        if bytes.is_empty() {
            return Err(MarketError::validation("avatar", "file is empty"));
        }

        let path = format!("{}/{}.{}", user, Uuid::new_v4(), ext);
        let content_type = crate::storage::objects::content_type_for(&path);
        self.objects
            .put(AVATAR_BUCKET, &path, bytes, content_type)
            .await?;
        let url = self.objects.public_url(AVATAR_BUCKET, &path);

        let avatar_url = url.clone();
        self.write_profile(user, move |profile, _| {
            profile.avatar_url = Some(avatar_url);
            Ok(())
        })
        .await?;
        log::info!("Uploaded avatar for {} to {}", user, path);
        Ok(url)
    }

    /// Show or hide the caller on the map. Hiding also forgets the location.
    pub async fn set_location_visibility(
        &self,
        user: &UserId,
        visible: bool,
        location: Option<GeoPoint>,
    ) -> MarketResult<Profile> {
        let location = if visible {
            let point = location.ok_or_else(|| {
                MarketError::validation("location", "a position is required to appear on the map")
            })?;
            validation::validate_location(&point)?;
            Some(point)
        } else {
            None
        };

        let profile = self
            .write_profile(user, move |profile, _| {
                profile.is_location_public = visible;
                profile.location = location;
                Ok(())
            })
            .await?;
        match location {
            Some(point) => log::info!("User {} shown on the map at {}", user, point),
            None => log::info!("User {} hidden from the map", user),
        }
        Ok(profile)
    }

    pub async fn public_map_users(&self) -> MarketResult<Vec<MapUser>> {
        Ok(self
            .store
            .list_profiles()
            .await?
            .into_iter()
            .filter(|p| p.is_location_public)
            .filter_map(|p| {
                p.location.map(|loc| MapUser {
                    id: p.id,
                    display_name: p.display_name,
                    avatar_url: p.avatar_url,
                    role: p.role,
                    lat: loc.lat,
                    lng: loc.lng,
                })
            })
            .collect())
    }

    pub async fn profile_card(&self, user: &UserId) -> MarketResult<ProfileCard> {
        let profile = self.get_profile(user).await?;
        let scenarios = self.scenarios_created_by(user).await?;
        Ok(ProfileCard {
            profile: profile.to_public(),
            scenarios,
        })
    }

    // Scenarios

    pub async fn create_scenario(&self, user: &UserId, input: NewScenario) -> MarketResult<Scenario> {
        validation::validate_title(&input.title)?;
        validation::validate_description(&input.description)?;
        validation::validate_price(input.price)?;

        let scenario = self
            .store
            .insert_scenario(ScenarioDraft {
                creator_id: *user,
                title: input.title.trim().to_string(),
                description: input.description.trim().to_string(),
                price: input.price,
            })
            .await?;
        log::info!("Scenario {} created by {}", scenario.id, user);
        self.events.publish_insert(Table::Scenarios, &scenario);
        Ok(scenario)
    }

    async fn scenarios_created_by(&self, user: &UserId) -> MarketResult<Vec<Scenario>> {
        let mut scenarios: Vec<_> = self
            .store
            .list_scenarios()
            .await?
            .into_iter()
            .filter(|s| s.creator_id == *user)
            .collect();
        scenarios.reverse();
        Ok(scenarios)
    }

    pub async fn list_my_scenarios(&self, user: &UserId) -> MarketResult<Vec<Scenario>> {
        self.scenarios_created_by(user).await
    }

    pub async fn delete_scenario(&self, user: &UserId, id: ScenarioId) -> MarketResult<Scenario> {
        let removed = self
            .store
            .remove_scenario::<_, MarketError>(id, |scenario| {
                if scenario.creator_id != *user {
                    return Err(MarketError::Forbidden(
                        "only the creator can delete a scenario".to_string(),
                    ));
                }
                Ok(())
            })
            .await?
            .ok_or_else(|| MarketError::not_found("scenario", id))?;
        log::info!("Scenario {} deleted by {}", id, user);
        self.events.publish_delete(Table::Scenarios, &removed);
        Ok(removed)
    }

    /// Catalog listing, newest first
    pub async fn scenarios_with_creator(&self) -> MarketResult<Vec<ScenarioWithCreator>> {
        let profiles = self.profile_index().await?;
        Ok(self
            .store
            .list_scenarios()
            .await?
            .into_iter()
            .rev()
            .map(|s| {
                let creator = profiles.get(&s.creator_id);
                ScenarioWithCreator {
                    creator_name: creator.and_then(|p| p.display_name.clone()),
                    creator_avatar: creator.and_then(|p| p.avatar_url.clone()),
                    id: s.id,
                    title: s.title,
                    description: s.description,
                    price: s.price,
                    created_at: s.created_at,
                    creator_id: s.creator_id,
                }
            })
            .collect())
    }

    /// The acceptor orders the scenario from its creator
    pub async fn accept_scenario(&self, user: &UserId, id: ScenarioId) -> MarketResult<Order> {
        let scenario = self
            .store
            .get_scenario(id)
            .await?
            .ok_or_else(|| MarketError::not_found("scenario", id))?;
        if scenario.creator_id == *user {
            return Err(MarketError::Forbidden(
                "cannot accept your own scenario".to_string(),
            ));
        }

        let order = self
            .store
            .insert_order(
                scenario.id,
                OrderDraft {
                    customer_id: *user,
                    performer_id: scenario.creator_id,
                    status: OrderStatus::Pending,
                    execution_time: None,
                    location: None,
                    transaction_hash: None,
                    payout_details: None,
                },
            )
            .await?;
        log::info!("Scenario {} accepted by {} as order {}", id, user, order.id);
        self.events.publish_insert(Table::Orders, &order.to_public());
        Ok(order)
    }

    // Orders

    /// Map flow: a customer orders a new scenario from a performer.
    /// A positive price needs a verified escrow transfer before anything is written.
    pub async fn create_order(&self, user: &UserId, input: NewOrder) -> MarketResult<OrderView> {
        if input.performer_id == *user {
            return Err(MarketError::validation(
                "performer_id",
                "cannot place an order with yourself",
            ));
        }
        validation::validate_title(&input.title)?;
        validation::validate_description(&input.description)?;
        validation::validate_price(input.price)?;
        validation::validate_location(&input.location)?;
        validation::validate_execution_time(
            input.execution_time,
            Utc::now(),
            Duration::minutes(self.rules.schedule_tolerance_minutes),
            Duration::days(self.rules.max_schedule_days),
        )?;

        if self.store.get_profile(&input.performer_id).await?.is_none() {
            return Err(MarketError::not_found("profile", input.performer_id));
        }

        let transaction_hash = if input.price.is_zero() {
            if input.transaction_hash.is_some() {
                return Err(MarketError::validation(
                    "transaction_hash",
                    "free orders carry no payment",
                ));
            }
            None
        } else {
            let hash = input.transaction_hash.as_deref().ok_or_else(|| {
                MarketError::PaymentRequired("a paid order needs a transaction hash".to_string())
            })?;
            self.verify_payment(hash, input.price).await?;
            Some(hash.to_string())
        };

        let referrer_id = self
            .store
            .get_profile(user)
            .await?
            .and_then(|p| p.invited_by);
        let payout = self.split.split(input.price, referrer_id, self.amount_scale);
        let status = if transaction_hash.is_some() {
            OrderStatus::PaidPendingExecution
        } else {
            OrderStatus::PendingExecution
        };

        let (scenario, order) = self
            .store
            .insert_scenario_with_order(
                ScenarioDraft {
                    creator_id: *user,
                    title: input.title.trim().to_string(),
                    description: input.description.trim().to_string(),
                    price: input.price,
                },
                OrderDraft {
                    customer_id: *user,
                    performer_id: input.performer_id,
                    status,
                    execution_time: Some(input.execution_time),
                    location: Some(input.location),
                    transaction_hash,
                    payout_details: Some(payout),
                },
            )
            .await?;

        log::info!(
            "Order {} placed by {} for {} ({})",
            order.id,
            user,
            input.performer_id,
            order.status
        );
        self.events.publish_insert(Table::Scenarios, &scenario);
        self.events.publish_insert(Table::Orders, &order.to_public());
        self.order_view(order).await
    }

    async fn verify_payment(&self, hash: &str, price: Decimal) -> MarketResult<()> {
        validation::validate_tx_hash(hash)?;
        if let Some(existing) = self.store.find_order_by_transaction(hash).await? {
            return Err(MarketError::Conflict(format!(
                "transaction {hash} already backs order {existing}"
            )));
        }
        match self.verifier.verify(hash, price).await? {
            PaymentCheck::Confirmed => Ok(()),
            PaymentCheck::Pending => Err(MarketError::PaymentRequired(format!(
                "transaction {hash} is not confirmed yet"
            ))),
            PaymentCheck::Invalid(reason) => {
                log::debug!("Rejected payment {}: {}", hash, reason);
                Err(MarketError::PaymentRequired(reason))
            }
        }
    }

    async fn load_order(&self, id: OrderId) -> MarketResult<Order> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| MarketError::not_found("order", id))
    }

    /// Parties always see an order; disputed orders are public to voters
    pub async fn get_order(&self, user: &UserId, id: OrderId) -> MarketResult<OrderView> {
        let order = self.load_order(id).await?;
        if order.is_party(user) {
            return self.order_view(order).await;
        }
        if !is_public_dispute(&order) {
            return Err(MarketError::Forbidden(
                "order belongs to other users".to_string(),
            ));
        }
        self.order_view(order.to_public()).await
    }

    async fn order_view(&self, order: Order) -> MarketResult<OrderView> {
        let scenario = self.store.get_scenario(order.scenario_id).await?;
        let customer = self.store.get_profile(&order.customer_id).await?;
        let performer = self.store.get_profile(&order.performer_id).await?;
        Ok(OrderView {
            order,
            scenario,
            customer: customer.map(|p| p.to_public()),
            performer: performer.map(|p| p.to_public()),
        })
    }

    /// Customer edits while the order is still pending
    pub async fn edit_order(&self, user: &UserId, id: OrderId, edit: OrderEdit) -> MarketResult<OrderView> {
        if let Some(title) = &edit.title {
            validation::validate_title(title)?;
        }
        if let Some(description) = &edit.description {
            validation::validate_description(description)?;
        }
        if let Some(location) = &edit.location {
            validation::validate_location(location)?;
        }
        if let Some(at) = edit.execution_time {
            validation::validate_execution_time(
                at,
                Utc::now(),
                Duration::minutes(self.rules.schedule_tolerance_minutes),
                Duration::days(self.rules.max_schedule_days),
            )?;
        }

        let changes_text = edit.title.is_some() || edit.description.is_some();
        let change = self
            .store
            .update_order_with_scenario::<_, MarketError>(id, |order, scenario| {
                if order.customer_id != *user {
                    return Err(MarketError::Forbidden(
                        "only the customer can edit an order".to_string(),
                    ));
                }
                check_version(order, edit.expected_version)?;
                if !order.status.is_pending() {
                    return Err(MarketError::Conflict(format!(
                        "order in status {} can no longer be edited",
                        order.status
                    )));
                }
                if changes_text {
                    let scenario = scenario
                        .ok_or_else(|| MarketError::not_found("scenario", order.scenario_id))?;
                    // catalog listings belong to the performer and back other orders too
                    if scenario.creator_id != order.customer_id {
                        return Err(MarketError::Forbidden(
                            "title and description of a catalog scenario belong to its creator"
                                .to_string(),
                        ));
                    }
                    if let Some(title) = edit.title {
                        scenario.title = title.trim().to_string();
                    }
                    if let Some(description) = edit.description {
                        scenario.description = description.trim().to_string();
                    }
                }
                if let Some(at) = edit.execution_time {
                    order.execution_time = Some(at);
                }
                if let Some(location) = edit.location {
                    order.location = Some(location);
                }
                Ok(())
            })
            .await?
            .ok_or_else(|| MarketError::not_found("order", id))?;

        let (old, new) = change.order;
        self.events
            .publish_update(Table::Orders, &old.to_public(), &new.to_public());
        if let Some((old_scenario, new_scenario)) = change.scenario {
            self.events
                .publish_update(Table::Scenarios, &old_scenario, &new_scenario);
        }

        log::info!("Order {} edited by {}", id, user);
        self.order_view(new).await
    }

    /// A party moves the order along; the caller's role picks the actor
    pub async fn act(
        &self,
        user: &UserId,
        id: OrderId,
        action: OrderAction,
        expected_version: Option<u64>,
    ) -> MarketResult<Order> {
        let order = self.load_order(id).await?;
        let actor = Actor::of(&order, user).ok_or_else(|| {
            MarketError::Forbidden("only the customer or performer can act on an order".to_string())
        })?;
        self.apply_transition(id, action, actor, expected_version, None)
            .await
    }

    async fn apply_transition(
        &self,
        id: OrderId,
        action: OrderAction,
        actor: Actor,
        expected_version: Option<u64>,
        resolution: Option<Resolution>,
    ) -> MarketResult<Order> {
        let current = self.load_order(id).await?;
        let wallets = self.settlement_wallets(&current).await?;
        let now = Utc::now();

        let (old, new) = self
            .store
            .update_order::<_, MarketError>(id, |order| {
                check_version(order, expected_version)?;
                let to = transition(order.status, action, actor)?;
                order.status = to;
                if action == OrderAction::OpenDispute {
                    order.dispute_started_at = Some(now);
                }
                if resolution.is_some() {
                    order.resolution = resolution;
                }
                if order.settlement.is_none() {
                    order.settlement = settle(order, &wallets, now);
                }
                Ok(())
            })
            .await?
            .ok_or_else(|| MarketError::not_found("order", id))?;

        log::info!(
            "Order {}: {} -> {} ({} by {})",
            id,
            old.status,
            new.status,
            action,
            actor
        );
        self.events
            .publish_update(Table::Orders, &old.to_public(), &new.to_public());
        Ok(new)
    }

    async fn settlement_wallets(&self, order: &Order) -> MarketResult<SettlementWallets> {
        if !order.is_paid() {
            return Ok(SettlementWallets::default());
        }
        let wallet_of = |profile: Option<Profile>| profile.and_then(|p| p.wallet);
        let referrer = match order.payout_details.as_ref().and_then(|d| d.referrer_id) {
            Some(id) => wallet_of(self.store.get_profile(&id).await?),
            None => None,
        };
        Ok(SettlementWallets {
            payout: PayoutWallets {
                performer: wallet_of(self.store.get_profile(&order.performer_id).await?),
                referrer,
                platform: self.platform_wallet.clone(),
            },
            customer: wallet_of(self.store.get_profile(&order.customer_id).await?),
        })
    }

    // Queries

    async fn profile_index(&self) -> MarketResult<HashMap<UserId, Profile>> {
        Ok(self
            .store
            .list_profiles()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }

    async fn order_summaries<F>(&self, user: &UserId, keep: F) -> MarketResult<Vec<OrderSummary>>
    where
        F: Fn(&Order) -> bool,
    {
        let profiles = self.profile_index().await?;
        let scenarios: HashMap<ScenarioId, Scenario> = self
            .store
            .list_scenarios()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut rows: Vec<_> = self
            .store
            .list_orders()
            .await?
            .into_iter()
            .filter(|o| keep(o))
            .map(|o| {
                let other = if o.customer_id == *user {
                    o.performer_id
                } else {
                    o.customer_id
                };
                let scenario = scenarios.get(&o.scenario_id);
                let other_profile = profiles.get(&other);
                OrderSummary {
                    order_id: o.id,
                    order_status: o.status,
                    execution_time: o.execution_time,
                    title: scenario.map(|s| s.title.clone()),
                    description: scenario.map(|s| s.description.clone()),
                    price: scenario.map(|s| s.price),
                    customer_id: o.customer_id,
                    performer_id: o.performer_id,
                    other_user_id: other,
                    other_name: other_profile.and_then(|p| p.display_name.clone()),
                    other_avatar: other_profile.and_then(|p| p.avatar_url.clone()),
                    location_lat: o.location.map(|l| l.lat),
                    location_lng: o.location.map(|l| l.lng),
                    version: o.version,
                }
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// Performer view of orders waiting for an answer
    pub async fn incoming_requests(&self, user: &UserId) -> MarketResult<Vec<OrderSummary>> {
        self.order_summaries(user, |o| o.performer_id == *user && o.status.is_pending())
            .await
    }

    pub async fn my_created_orders(&self, user: &UserId) -> MarketResult<Vec<OrderSummary>> {
        self.order_summaries(user, |o| o.customer_id == *user).await
    }

    /// Performer view once an order got past the pending states
    pub async fn my_accepted_orders(&self, user: &UserId) -> MarketResult<Vec<OrderSummary>> {
        self.order_summaries(user, |o| {
            o.performer_id == *user
                && matches!(
                    o.status,
                    OrderStatus::InProgress
                        | OrderStatus::CompletedPendingApproval
                        | OrderStatus::Completed
                        | OrderStatus::Expired
                        | OrderStatus::Disputed
                )
        })
        .await
    }

    pub async fn my_orders(&self, user: &UserId, tab: OrderTab) -> MarketResult<Vec<OrderSummary>> {
        self.order_summaries(user, |o| o.is_party(user) && tab.includes(o.status))
            .await
    }

    // Disputes

    pub async fn dispute_view(&self, user: &UserId, id: OrderId) -> MarketResult<DisputeView> {
        let order = self.load_order(id).await?;
        if !order.is_party(user) && !is_public_dispute(&order) {
            return Err(MarketError::Forbidden(
                "order is not under public dispute".to_string(),
            ));
        }
        let votes = self.store.list_votes(id).await?;
        let tally = DisputeTally::from_votes(&votes);
        let rules = self.rules.dispute_rules();
        let my_vote = votes
            .iter()
            .find(|v| v.voter_id == *user)
            .map(|v| v.vote_side);
        let can_vote =
            order.status == OrderStatus::Disputed && !order.is_party(user) && my_vote.is_none();
        let ends_at = order.dispute_started_at.map(|at| rules.ends_at(at));

        let order = if order.is_party(user) {
            order
        } else {
            order.to_public()
        };
        Ok(DisputeView {
            order: self.order_view(order).await?,
            performer_votes: tally.performer,
            customer_votes: tally.customer,
            performer_percent: tally.performer_percent(),
            win_threshold: rules.win_threshold,
            ends_at,
            my_vote,
            can_vote,
        })
    }

    /// Record a vote; reaching the threshold resolves the dispute at once
    pub async fn cast_vote(&self, user: &UserId, id: OrderId, side: VoteSide) -> MarketResult<DisputeView> {
        let vote = DisputeVote {
            order_id: id,
            voter_id: *user,
            vote_side: side,
            created_at: Utc::now(),
        };
        let vote = self
            .store
            .insert_vote::<_, MarketError>(vote, |order| {
                if order.status != OrderStatus::Disputed {
                    return Err(MarketError::Conflict(format!(
                        "order {} is not under dispute",
                        order.id
                    )));
                }
                if order.is_party(user) {
                    return Err(MarketError::Forbidden(
                        "parties to an order cannot vote on its dispute".to_string(),
                    ));
                }
                Ok(())
            })
            .await?;
        log::info!("Vote for {} on order {} by {}", side, id, user);
        self.events.publish_insert(Table::DisputeVotes, &vote);

        match self.try_resolve(id, Utc::now()).await {
            // the monitor got there first
            Ok(_) | Err(MarketError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        self.dispute_view(user, id).await
    }

    /// Resolve a disputed order if the votes or the clock decide it
    async fn try_resolve(&self, id: OrderId, now: DateTime<Utc>) -> MarketResult<bool> {
        let order = self.load_order(id).await?;
        if order.status != OrderStatus::Disputed {
            return Ok(false);
        }
        let started_at = order.dispute_started_at.unwrap_or(order.status_changed_at);
        let tally = DisputeTally::from_votes(&self.store.list_votes(id).await?);
        let Some(winner) = self.rules.dispute_rules().outcome(&tally, started_at, now) else {
            return Ok(false);
        };

        let action = match winner {
            VoteSide::Performer => OrderAction::ResolveForPerformer,
            VoteSide::Customer => OrderAction::ResolveForCustomer,
        };
        let resolution = Resolution {
            winner,
            performer_votes: tally.performer,
            customer_votes: tally.customer,
            resolved_at: now,
        };
        self.apply_transition(id, action, Actor::System, Some(order.version), Some(resolution))
            .await?;
        log::info!(
            "Dispute on order {} resolved for the {} ({}:{})",
            id,
            winner,
            tally.performer,
            tally.customer
        );
        Ok(true)
    }

    // Background work

    /// Expire overdue orders, auto-approve finished work and close disputes
    pub async fn sweep(&self, now: DateTime<Utc>) -> MarketResult<SweepReport> {
        let grace = Duration::minutes(self.rules.expiry_grace_minutes);
        let approval_window = Duration::hours(self.rules.approval_window_hours);
        let mut report = SweepReport::default();

        for order in self.store.list_orders().await? {
            let outcome = match order.status {
                s if s.is_pending() || s == OrderStatus::InProgress => match order.execution_time {
                    Some(at) if at + grace < now => self
                        .apply_transition(order.id, OrderAction::Expire, Actor::System, Some(order.version), None)
                        .await
                        .map(|_| report.expired += 1),
                    _ => Ok(()),
                },
                OrderStatus::CompletedPendingApproval if order.status_changed_at + approval_window < now => self
                    .apply_transition(
                        order.id,
                        OrderAction::AutoApprove,
                        Actor::System,
                        Some(order.version),
                        None,
                    )
                    .await
                    .map(|_| report.auto_approved += 1),
                OrderStatus::Disputed => self.try_resolve(order.id, now).await.map(|resolved| {
                    if resolved {
                        report.disputes_resolved += 1;
                    }
                }),
                _ => Ok(()),
            };

            match outcome {
                Ok(()) => {}
                Err(MarketError::Conflict(msg)) | Err(MarketError::NotFound { id: msg, .. }) => {
                    log::debug!("Sweep skipped order {}: {}", order.id, msg)
                }
                Err(MarketError::InvalidTransition(e)) => {
                    log::debug!("Sweep skipped order {}: {}", order.id, e)
                }
                Err(e) => log::warn!("Sweep failed on order {}: {}", order.id, e),
            }
        }

        if report != SweepReport::default() {
            log::info!(
                "Sweep: {} expired, {} auto-approved, {} disputes resolved",
                report.expired,
                report.auto_approved,
                report.disputes_resolved
            );
        }
        Ok(report)
    }

    /// Pay out open settlement legs when an escrow signer is configured.
    /// Returns how many legs confirmed on this pass.
    pub async fn execute_settlements(&self) -> MarketResult<usize> {
        let Some(executor) = &self.settlement else {
            return Ok(0);
        };

        let mut confirmed = 0;
        for order in self.store.list_orders().await? {
            let Some(before) = order.settlement.clone() else {
                continue;
            };
            if !before.has_pending_legs() {
                continue;
            }
            let mut settlement = before.clone();
            confirmed += executor.execute(&mut settlement).await;
            if settlement == before {
                continue;
            }

            // broadcast hashes must be stored before the next pass looks at the leg
            let updated = self
                .store
                .update_order::<_, MarketError>(order.id, |current| {
                    if let Some(stored) = current.settlement.as_mut() {
                        for (leg, done) in stored.legs.iter_mut().zip(&settlement.legs) {
                            leg.tx_hash = done.tx_hash.clone();
                            leg.confirmed = done.confirmed;
                        }
                    }
                    Ok(())
                })
                .await
                .map_err(|e| {
                    log::error!("Failed to record settlement progress on order {}: {}", order.id, e);
                    e
                })?;
            if let Some((old, new)) = updated {
                self.events
                    .publish_update(Table::Orders, &old.to_public(), &new.to_public());
            }
        }
        Ok(confirmed)
    }
}

#[derive(Debug, Clone, Default)]
struct SettlementWallets {
    payout: PayoutWallets,
    customer: Option<String>,
}

/// Settlement owed once a paid order reaches a terminal status
fn settle(order: &Order, wallets: &SettlementWallets, now: DateTime<Utc>) -> Option<Settlement> {
    if !order.is_paid() || !order.status.is_terminal() {
        return None;
    }
    let details = order.payout_details.as_ref()?;
    Some(if order.status == OrderStatus::Completed {
        payout_settlement(details, order.performer_id, &wallets.payout, now)
    } else {
        refund_settlement(details.total(), order.customer_id, wallets.customer.clone(), now)
    })
}

fn check_version(order: &Order, expected: Option<u64>) -> MarketResult<()> {
    match expected {
        Some(v) if v != order.version => Err(MarketError::Conflict(format!(
            "order {} is at version {}, not {}",
            order.id, order.version, v
        ))),
        _ => Ok(()),
    }
}

fn is_public_dispute(order: &Order) -> bool {
    order.status == OrderStatus::Disputed || order.resolution.is_some()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn generate_referral_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase()
}
