use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::types::UserId;

/// Revenue split ratios
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayoutSplit {
    pub performer_ratio: Decimal,
    pub platform_ratio: Decimal,
    pub referrer_ratio: Decimal,
}

impl PayoutSplit {
    /// Split `price` into the three shares. Performer and referrer shares are
    /// truncated to `scale` places and the platform share takes the remainder,
    /// so the amounts always add up to the price.
    pub fn split(&self, price: Decimal, referrer_id: Option<UserId>, scale: u32) -> PayoutDetails {
        let share = |ratio: Decimal| {
            (price * ratio).round_dp_with_strategy(scale, RoundingStrategy::ToZero)
        };
        let performer_amount = share(self.performer_ratio);
        let referrer_amount = share(self.referrer_ratio);
        PayoutDetails {
            performer_amount,
            platform_amount: price - performer_amount - referrer_amount,
            referrer_amount,
            referrer_id,
        }
    }
}

impl Default for PayoutSplit {
    /// 90 / 5 / 5
    fn default() -> Self {
        Self {
            performer_ratio: Decimal::new(90, 2),
            platform_ratio: Decimal::new(5, 2),
            referrer_ratio: Decimal::new(5, 2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayoutDetails {
    pub performer_amount: Decimal,
    pub platform_amount: Decimal,
    pub referrer_amount: Decimal,
    pub referrer_id: Option<UserId>,
}

impl PayoutDetails {
    pub fn total(&self) -> Decimal {
        self.performer_amount + self.platform_amount + self.referrer_amount
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Performer,
    Platform,
    Referrer,
    Customer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Payout,
    Refund,
}

/// One transfer out of escrow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub recipient: Recipient,
    pub user_id: Option<UserId>,
    /// `None` keeps the amount in escrow until someone pays it out by hand
    pub wallet: Option<String>,
    pub amount: Decimal,
    /// Set as soon as the transfer is broadcast
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
}

impl SettlementLeg {
    fn new(recipient: Recipient, user_id: Option<UserId>, wallet: Option<String>, amount: Decimal) -> Self {
        Self {
            recipient,
            user_id,
            wallet,
            amount,
            tx_hash: None,
            confirmed: false,
        }
    }

    /// Nothing sent yet and somewhere to send it
    pub fn is_executable(&self) -> bool {
        self.wallet.is_some() && self.tx_hash.is_none() && self.amount > Decimal::ZERO
    }

    /// Sent, but the receipt has not been seen
    pub fn is_awaiting_confirmation(&self) -> bool {
        self.tx_hash.is_some() && !self.confirmed
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub kind: SettlementKind,
    pub legs: Vec<SettlementLeg>,
    pub created_at: DateTime<Utc>,
}

impl Settlement {
    pub fn has_pending_legs(&self) -> bool {
        self.legs
            .iter()
            .any(|leg| leg.is_executable() || leg.is_awaiting_confirmation())
    }

    pub fn total(&self) -> Decimal {
        self.legs.iter().map(|l| l.amount).sum()
    }
}

/// Wallet addresses known at settlement time
#[derive(Clone, Debug, Default)]
pub struct PayoutWallets {
    pub performer: Option<String>,
    pub referrer: Option<String>,
    pub platform: Option<String>,
}

/// Legs for a completed order. Without a referrer the referrer share goes to
/// the platform leg.
pub fn payout_settlement(
    details: &PayoutDetails,
    performer_id: UserId,
    wallets: &PayoutWallets,
    now: DateTime<Utc>,
) -> Settlement {
    let mut legs = vec![SettlementLeg::new(
        Recipient::Performer,
        Some(performer_id),
        wallets.performer.clone(),
        details.performer_amount,
    )];

    let mut platform_amount = details.platform_amount;
    match details.referrer_id {
        Some(referrer_id) => legs.push(SettlementLeg::new(
            Recipient::Referrer,
            Some(referrer_id),
            wallets.referrer.clone(),
            details.referrer_amount,
        )),
        None => platform_amount += details.referrer_amount,
    }

    legs.push(SettlementLeg::new(
        Recipient::Platform,
        None,
        wallets.platform.clone(),
        platform_amount,
    ));

    Settlement {
        kind: SettlementKind::Payout,
        legs,
        created_at: now,
    }
}

/// Full refund to the customer
pub fn refund_settlement(
    amount: Decimal,
    customer_id: UserId,
    customer_wallet: Option<String>,
    now: DateTime<Utc>,
) -> Settlement {
    Settlement {
        kind: SettlementKind::Refund,
        legs: vec![SettlementLeg::new(
            Recipient::Customer,
            Some(customer_id),
            customer_wallet,
            amount,
        )],
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;
    use uuid::Uuid;

    #[test]
    fn default_split_is_90_5_5() {
        let details = PayoutSplit::default().split(Decimal::from(100), None, 18);
        assert_eq!(details.performer_amount, Decimal::from(90));
        assert_eq!(details.platform_amount, Decimal::from(5));
        assert_eq!(details.referrer_amount, Decimal::from(5));
    }

    #[test]
    fn platform_absorbs_rounding() {
        let details = PayoutSplit::default().split(Decimal::from_str("0.03").unwrap(), None, 2);
        assert_eq!(details.performer_amount, Decimal::from_str("0.02").unwrap());
        assert_eq!(details.referrer_amount, Decimal::ZERO);
        assert_eq!(details.platform_amount, Decimal::from_str("0.01").unwrap());
    }

    #[test]
    fn sent_leg_waits_for_its_receipt() {
        let mut leg = SettlementLeg::new(
            Recipient::Performer,
            None,
            Some("0xperformer".into()),
            Decimal::ONE,
        );
        assert!(leg.is_executable());

        leg.tx_hash = Some("0xsent".into());
        assert!(!leg.is_executable());
        assert!(leg.is_awaiting_confirmation());

        leg.confirmed = true;
        let settlement = Settlement {
            kind: SettlementKind::Payout,
            legs: vec![leg],
            created_at: Utc::now(),
        };
        assert!(!settlement.has_pending_legs());
    }

    #[test]
    fn missing_referrer_share_goes_to_platform() {
        let details = PayoutSplit::default().split(Decimal::from(20), None, 6);
        let wallets = PayoutWallets {
            performer: Some("0xperformer".into()),
            ..Default::default()
        };
        let settlement = payout_settlement(&details, Uuid::new_v4(), &wallets, Utc::now());

        assert_eq!(settlement.legs.len(), 2);
        assert_eq!(settlement.legs[1].recipient, Recipient::Platform);
        assert_eq!(settlement.legs[1].amount, Decimal::from(2));
        assert_eq!(settlement.total(), Decimal::from(20));
        // only the performer leg has a wallet
        assert!(settlement.has_pending_legs());
        assert!(!settlement.legs[1].is_executable());
    }

    #[test]
    fn refund_returns_the_full_price() {
        let settlement = refund_settlement(Decimal::from(7), Uuid::new_v4(), None, Utc::now());
        assert_eq!(settlement.kind, SettlementKind::Refund);
        assert_eq!(settlement.total(), Decimal::from(7));
        assert!(!settlement.has_pending_legs());
    }

    proptest! {
        #[test]
        fn split_always_sums_to_price(cents in 0u64..10_000_000_000, scale in 0u32..18) {
            let price = Decimal::new(cents as i64, 2);
            let details = PayoutSplit::default().split(price, Some(Uuid::nil()), scale);
            prop_assert_eq!(details.total(), price);
            prop_assert!(details.platform_amount >= Decimal::ZERO);
            prop_assert!(details.performer_amount <= price);
        }
    }
}
