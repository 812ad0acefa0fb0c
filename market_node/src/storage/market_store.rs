//! Typed repository for marketplace records on top of a [`Storage`] backend.
//!
//! Records are stored as JSON under table prefixes (`profiles/`, `scenarios/`,
//! `orders/`, `dispute_votes/`). Numeric ids are zero-padded so prefix scans
//! return rows in id order. Read-modify-write operations take the write gate,
//! which makes version checks, unique indexes and vote inserts atomic.

use super::{BatchOp, Result, Storage, StorageError};
use crate::market::types::{
    DisputeVote, Order, OrderDraft, OrderId, Profile, Scenario, ScenarioDraft, ScenarioId, UserId,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

const PROFILES: &str = "profiles/";
const SCENARIOS: &str = "scenarios/";
const ORDERS: &str = "orders/";
const VOTES: &str = "dispute_votes/";
const REFERRAL_INDEX: &str = "idx/referral_code/";
const TX_INDEX: &str = "idx/transaction_hash/";
const SCENARIO_SEQ: &[u8] = b"seq/scenarios";
const ORDER_SEQ: &[u8] = b"seq/orders";

fn profile_key(id: &UserId) -> Vec<u8> {
    format!("{PROFILES}{id}").into_bytes()
}

fn scenario_key(id: ScenarioId) -> Vec<u8> {
    format!("{SCENARIOS}{id:020}").into_bytes()
}

fn order_key(id: OrderId) -> Vec<u8> {
    format!("{ORDERS}{id:020}").into_bytes()
}

fn votes_prefix(order_id: OrderId) -> String {
    format!("{VOTES}{order_id:020}/")
}

fn vote_key(order_id: OrderId, voter: &UserId) -> Vec<u8> {
    format!("{}{voter}", votes_prefix(order_id)).into_bytes()
}

fn referral_key(code: &str) -> Vec<u8> {
    format!("{REFERRAL_INDEX}{}", code.to_ascii_uppercase()).into_bytes()
}

fn tx_key(hash: &str) -> Vec<u8> {
    format!("{TX_INDEX}{}", hash.to_ascii_lowercase()).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Before and after rows of an order edit
#[derive(Debug, Clone)]
pub struct OrderChange {
    pub order: (Order, Order),
    pub scenario: Option<(Scenario, Scenario)>,
}

fn stamp_order(old: &Order, new: &mut Order) {
    let now = Utc::now();
    new.id = old.id;
    new.version = old.version + 1;
    new.updated_at = now;
    if new.status != old.status {
        new.status_changed_at = now;
    }
}

pub struct MarketStore {
    kv: Arc<dyn Storage>,
    write_gate: Mutex<()>,
}

impl MarketStore {
    pub fn new(kv: Arc<dyn Storage>) -> Self {
        Self {
            kv,
            write_gate: Mutex::new(()),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.kv
            .scan(prefix.as_bytes())
            .await?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Next value of a sequence plus the batch op persisting it.
    /// Caller must hold the write gate.
    async fn next_id(&self, seq: &[u8]) -> Result<(u64, BatchOp)> {
        let current: u64 = self.read(seq).await?.unwrap_or(0);
        let next = current + 1;
        Ok((next, BatchOp::Put(seq.to_vec(), encode(&next)?)))
    }

    // Profiles

    pub async fn get_profile(&self, id: &UserId) -> Result<Option<Profile>> {
        self.read(&profile_key(id)).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.read_all(PROFILES).await
    }

    pub async fn find_profile_by_referral_code(&self, code: &str) -> Result<Option<Profile>> {
        match self.read::<UserId>(&referral_key(code)).await? {
            Some(id) => self.get_profile(&id).await,
            None => Ok(None),
        }
    }

    /// Create or update a profile. `mutate` sees the current row (if any) and
    /// returns the row to store. Referral codes stay unique.
    pub async fn upsert_profile<F, E>(
        &self,
        id: &UserId,
        mutate: F,
    ) -> std::result::Result<(Option<Profile>, Profile), E>
    where
        F: FnOnce(Option<&Profile>) -> std::result::Result<Profile, E>,
        E: From<StorageError>,
    {
        let _gate = self.write_gate.lock().await;
        let old = self.get_profile(id).await?;
        let mut new = mutate(old.as_ref())?;
        new.id = *id;
        new.updated_at = Utc::now();

        let mut ops = Vec::with_capacity(3);
        let old_code = old.as_ref().map(|p| p.referral_code.as_str());
        if old_code != Some(new.referral_code.as_str()) {
            if let Some(owner) = self.read::<UserId>(&referral_key(&new.referral_code)).await? {
                if owner != *id {
                    return Err(StorageError::Conflict(format!(
                        "referral code {} already taken",
                        new.referral_code
                    ))
                    .into());
                }
            }
            if let Some(code) = old_code {
                ops.push(BatchOp::Delete(referral_key(code)));
            }
            ops.push(BatchOp::Put(referral_key(&new.referral_code), encode(id)?));
        }
        ops.push(BatchOp::Put(profile_key(id), encode(&new)?));
        self.kv.write_batch(ops).await?;
        Ok((old, new))
    }

    // Scenarios

    pub async fn get_scenario(&self, id: ScenarioId) -> Result<Option<Scenario>> {
        self.read(&scenario_key(id)).await
    }

    pub async fn list_scenarios(&self) -> Result<Vec<Scenario>> {
        self.read_all(SCENARIOS).await
    }

    async fn scenario_ops(&self, draft: ScenarioDraft) -> Result<(Scenario, Vec<BatchOp>)> {
        let (id, seq_op) = self.next_id(SCENARIO_SEQ).await?;
        let scenario = Scenario {
            id,
            creator_id: draft.creator_id,
            title: draft.title,
            description: draft.description,
            price: draft.price,
            created_at: Utc::now(),
        };
        let ops = vec![seq_op, BatchOp::Put(scenario_key(id), encode(&scenario)?)];
        Ok((scenario, ops))
    }

    pub async fn insert_scenario(&self, draft: ScenarioDraft) -> Result<Scenario> {
        let _gate = self.write_gate.lock().await;
        let (scenario, ops) = self.scenario_ops(draft).await?;
        self.kv.write_batch(ops).await?;
        Ok(scenario)
    }

    /// Delete a scenario after `check` approves the current row
    pub async fn remove_scenario<F, E>(
        &self,
        id: ScenarioId,
        check: F,
    ) -> std::result::Result<Option<Scenario>, E>
    where
        F: FnOnce(&Scenario) -> std::result::Result<(), E>,
        E: From<StorageError>,
    {
        let _gate = self.write_gate.lock().await;
        let Some(scenario) = self.get_scenario(id).await? else {
            return Ok(None);
        };
        check(&scenario)?;
        self.kv.delete(&scenario_key(id)).await?;
        Ok(Some(scenario))
    }

    // Orders

    pub async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        self.read(&order_key(id)).await
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        self.read_all(ORDERS).await
    }

    pub async fn find_order_by_transaction(&self, hash: &str) -> Result<Option<OrderId>> {
        self.read(&tx_key(hash)).await
    }

    async fn order_ops(
        &self,
        scenario_id: ScenarioId,
        draft: OrderDraft,
    ) -> Result<(Order, Vec<BatchOp>)> {
        let mut ops = Vec::with_capacity(3);
        if let Some(hash) = &draft.transaction_hash {
            if let Some(existing) = self.find_order_by_transaction(hash).await? {
                return Err(StorageError::Conflict(format!(
                    "transaction {hash} already backs order {existing}"
                )));
            }
        }

        let (id, seq_op) = self.next_id(ORDER_SEQ).await?;
        ops.push(seq_op);
        let now = Utc::now();
        let order = Order {
            id,
            scenario_id,
            customer_id: draft.customer_id,
            performer_id: draft.performer_id,
            status: draft.status,
            execution_time: draft.execution_time,
            location: draft.location,
            transaction_hash: draft.transaction_hash,
            payout_details: draft.payout_details,
            dispute_started_at: None,
            resolution: None,
            settlement: None,
            version: 1,
            status_changed_at: now,
            created_at: now,
            updated_at: now,
        };
        if let Some(hash) = &order.transaction_hash {
            ops.push(BatchOp::Put(tx_key(hash), encode(&id)?));
        }
        ops.push(BatchOp::Put(order_key(id), encode(&order)?));
        Ok((order, ops))
    }

    pub async fn insert_order(&self, scenario_id: ScenarioId, draft: OrderDraft) -> Result<Order> {
        let _gate = self.write_gate.lock().await;
        let (order, ops) = self.order_ops(scenario_id, draft).await?;
        self.kv.write_batch(ops).await?;
        Ok(order)
    }

    /// Scenario and order in one batch
    pub async fn insert_scenario_with_order(
        &self,
        scenario: ScenarioDraft,
        order: OrderDraft,
    ) -> Result<(Scenario, Order)> {
        let _gate = self.write_gate.lock().await;
        let (scenario, mut ops) = self.scenario_ops(scenario).await?;
        let (order, order_ops) = self.order_ops(scenario.id, order).await?;
        ops.extend(order_ops);
        self.kv.write_batch(ops).await?;
        Ok((scenario, order))
    }

    /// Read-modify-write of one order. The version is bumped on every write
    /// and `status_changed_at` follows status changes.
    pub async fn update_order<F, E>(
        &self,
        id: OrderId,
        mutate: F,
    ) -> std::result::Result<Option<(Order, Order)>, E>
    where
        F: FnOnce(&mut Order) -> std::result::Result<(), E>,
        E: From<StorageError>,
    {
        let _gate = self.write_gate.lock().await;
        let Some(old) = self.get_order(id).await? else {
            return Ok(None);
        };
        let mut new = old.clone();
        mutate(&mut new)?;
        stamp_order(&old, &mut new);
        self.kv.put(&order_key(id), &encode(&new)?).await?;
        Ok(Some((old, new)))
    }

    /// Like [`update_order`](Self::update_order), but `mutate` also sees the
    /// order's scenario (if it still exists) and both rows land in one batch.
    /// The scenario change is returned only when the row actually changed.
    pub async fn update_order_with_scenario<F, E>(
        &self,
        id: OrderId,
        mutate: F,
    ) -> std::result::Result<Option<OrderChange>, E>
    where
        F: FnOnce(&mut Order, Option<&mut Scenario>) -> std::result::Result<(), E>,
        E: From<StorageError>,
    {
        let _gate = self.write_gate.lock().await;
        let Some(old) = self.get_order(id).await? else {
            return Ok(None);
        };
        let old_scenario = self.get_scenario(old.scenario_id).await?;
        let mut new = old.clone();
        let mut new_scenario = old_scenario.clone();
        mutate(&mut new, new_scenario.as_mut())?;
        stamp_order(&old, &mut new);

        let mut ops = vec![BatchOp::Put(order_key(id), encode(&new)?)];
        let scenario = match (old_scenario, new_scenario) {
            (Some(before), Some(mut after)) if before != after => {
                after.id = before.id;
                ops.push(BatchOp::Put(scenario_key(before.id), encode(&after)?));
                Some((before, after))
            }
            _ => None,
        };
        self.kv.write_batch(ops).await?;
        Ok(Some(OrderChange {
            order: (old, new),
            scenario,
        }))
    }

    // Dispute votes

    /// Insert a vote after `check` approves the order; one vote per voter
    pub async fn insert_vote<F, E>(&self, vote: DisputeVote, check: F) -> std::result::Result<DisputeVote, E>
    where
        F: FnOnce(&Order) -> std::result::Result<(), E>,
        E: From<StorageError>,
    {
        let _gate = self.write_gate.lock().await;
        let order = self
            .get_order(vote.order_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("order {}", vote.order_id)))?;
        check(&order)?;

        let key = vote_key(vote.order_id, &vote.voter_id);
        if self.kv.exists(&key).await? {
            return Err(StorageError::Conflict(format!(
                "{} already voted on order {}",
                vote.voter_id, vote.order_id
            ))
            .into());
        }
        self.kv.put(&key, &encode(&vote)?).await?;
        Ok(vote)
    }

    pub async fn list_votes(&self, order_id: OrderId) -> Result<Vec<DisputeVote>> {
        self.read_all(&votes_prefix(order_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{OrderStatus, VoteSide};
    use crate::storage::MemoryStorage;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn store() -> MarketStore {
        MarketStore::new(Arc::new(MemoryStorage::new()))
    }

    fn scenario_draft(creator: UserId) -> ScenarioDraft {
        ScenarioDraft {
            creator_id: creator,
            title: "Sing a song".into(),
            description: "In the park".into(),
            price: Decimal::from(10),
        }
    }

    fn order_draft(customer: UserId, performer: UserId, tx: Option<&str>) -> OrderDraft {
        OrderDraft {
            customer_id: customer,
            performer_id: performer,
            status: OrderStatus::PendingExecution,
            execution_time: None,
            location: None,
            transaction_hash: tx.map(str::to_string),
            payout_details: None,
        }
    }

    #[tokio::test]
    async fn ids_are_sequential() {
        let store = store();
        let creator = Uuid::new_v4();
        let a = store.insert_scenario(scenario_draft(creator)).await.unwrap();
        let b = store.insert_scenario(scenario_draft(creator)).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.list_scenarios().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transaction_hash_backs_one_order() {
        let store = store();
        let (customer, performer) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, order) = store
            .insert_scenario_with_order(
                scenario_draft(customer),
                order_draft(customer, performer, Some("0xABC")),
            )
            .await
            .unwrap();
        assert_eq!(order.version, 1);

        let err = store
            .insert_scenario_with_order(
                scenario_draft(customer),
                order_draft(customer, performer, Some("0xabc")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        // the failed batch wrote nothing
        assert_eq!(store.list_scenarios().await.unwrap().len(), 1);
        assert_eq!(store.find_order_by_transaction("0xabc").await.unwrap(), Some(order.id));
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = store();
        let order = store
            .insert_order(1, order_draft(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap();

        let (old, new) = store
            .update_order::<_, StorageError>(order.id, |o| {
                o.status = OrderStatus::InProgress;
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.version, 1);
        assert_eq!(new.version, 2);
        assert!(new.status_changed_at >= old.status_changed_at);

        let missing = store
            .update_order::<_, StorageError>(999, |_| Ok(()))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn failed_order_edit_leaves_scenario_alone() {
        let store = store();
        let (customer, performer) = (Uuid::new_v4(), Uuid::new_v4());
        let (scenario, order) = store
            .insert_scenario_with_order(
                scenario_draft(performer),
                order_draft(customer, performer, None),
            )
            .await
            .unwrap();

        let err = store
            .update_order_with_scenario::<_, StorageError>(order.id, |_, scenario| {
                if let Some(scenario) = scenario {
                    scenario.title = "Changed".into();
                }
                Err(StorageError::Conflict("rejected".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(store.get_scenario(scenario.id).await.unwrap(), Some(scenario.clone()));
        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().version, 1);

        let edit = store
            .update_order_with_scenario::<_, StorageError>(order.id, |_, scenario| {
                if let Some(scenario) = scenario {
                    scenario.title = "Changed".into();
                }
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edit.order.1.version, 2);
        let (_, after) = edit.scenario.unwrap();
        assert_eq!(store.get_scenario(scenario.id).await.unwrap(), Some(after));
    }

    #[tokio::test]
    async fn second_vote_is_a_conflict() {
        let store = store();
        let order = store
            .insert_order(1, order_draft(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap();
        let vote = DisputeVote {
            order_id: order.id,
            voter_id: Uuid::new_v4(),
            vote_side: VoteSide::Customer,
            created_at: Utc::now(),
        };

        store
            .insert_vote::<_, StorageError>(vote.clone(), |_| Ok(()))
            .await
            .unwrap();
        let err = store
            .insert_vote::<_, StorageError>(vote, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(store.list_votes(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn referral_codes_are_unique() {
        let store = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .upsert_profile::<_, StorageError>(&a, |_| Ok(Profile::new(a, "CODE1".into(), Utc::now())))
            .await
            .unwrap();

        let found = store.find_profile_by_referral_code("code1").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(a));

        let err = store
            .upsert_profile::<_, StorageError>(&b, |_| Ok(Profile::new(b, "CODE1".into(), Utc::now())))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
