//! Credit packs sold through the payment providers

use serde::Serialize;
use shipmail_shared::CreditAmounts;

use crate::error::{BillingError, BillingResult};

/// Currency every pack is priced in
pub const PLAN_CURRENCY: &str = "usd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPlan {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: CreditAmounts,
    pub price_cents: i64,
}

pub static PLANS: [CreditPlan; 5] = [
    CreditPlan {
        id: "emails-5k",
        name: "5,000 email credits",
        credits: CreditAmounts {
            emails: 5_000,
            sms: 0,
            leads: 0,
        },
        price_cents: 1_900,
    },
    CreditPlan {
        id: "emails-25k",
        name: "25,000 email credits",
        credits: CreditAmounts {
            emails: 25_000,
            sms: 0,
            leads: 0,
        },
        price_cents: 7_900,
    },
    CreditPlan {
        id: "sms-1k",
        name: "1,000 SMS credits",
        credits: CreditAmounts {
            emails: 0,
            sms: 1_000,
            leads: 0,
        },
        price_cents: 2_900,
    },
    CreditPlan {
        id: "leads-500",
        name: "500 lead credits",
        credits: CreditAmounts {
            emails: 0,
            sms: 0,
            leads: 500,
        },
        price_cents: 2_500,
    },
    CreditPlan {
        id: "growth-bundle",
        name: "Growth bundle",
        credits: CreditAmounts {
            emails: 20_000,
            sms: 1_000,
            leads: 1_000,
        },
        price_cents: 12_900,
    },
];

pub fn find_plan(plan_id: &str) -> BillingResult<&'static CreditPlan> {
    PLANS
        .iter()
        .find(|p| p.id == plan_id)
        .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_known_plan() {
        let plan = find_plan("growth-bundle").unwrap();
        assert_eq!(plan.credits.emails, 20_000);
        assert_eq!(plan.credits.sms, 1_000);
        assert_eq!(plan.credits.leads, 1_000);
        assert_eq!(plan.price_cents, 12_900);
    }

    #[test]
    fn test_unknown_plan() {
        assert!(matches!(
            find_plan("emails-1m"),
            Err(BillingError::UnknownPlan(id)) if id == "emails-1m"
        ));
    }

    #[test]
    fn test_every_plan_grants_something() {
        for plan in PLANS.iter() {
            assert!(!plan.credits.is_zero(), "{} grants nothing", plan.id);
            assert!(plan.credits.first_negative().is_none());
            assert!(plan.price_cents > 0);
        }
    }
}
