//! Domain types shared by the API, billing and worker crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored or submitted value doesn't name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Subscription tiers
// =============================================================================

/// Subscription plan a user is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Starter,
    Growth,
    Pro,
}

/// Base allowances and feature flags for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub max_emails: i64,
    pub max_sms: i64,
    pub max_contacts: i64,
    /// Requests per day against the public leads API
    pub lead_api_requests_per_day: u32,
    pub features: TierFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierFeatures {
    pub sms_campaigns: bool,
    pub ai_generation: bool,
    pub api_access: bool,
    pub priority_support: bool,
}

const FREE_LIMITS: TierLimits = TierLimits {
    max_emails: 250,
    max_sms: 0,
    max_contacts: 50,
    lead_api_requests_per_day: 100,
    features: TierFeatures {
        sms_campaigns: false,
        ai_generation: false,
        api_access: false,
        priority_support: false,
    },
};

const STARTER_LIMITS: TierLimits = TierLimits {
    max_emails: 5_000,
    max_sms: 500,
    max_contacts: 1_000,
    lead_api_requests_per_day: 1_000,
    features: TierFeatures {
        sms_campaigns: true,
        ai_generation: false,
        api_access: true,
        priority_support: false,
    },
};

const GROWTH_LIMITS: TierLimits = TierLimits {
    max_emails: 25_000,
    max_sms: 2_500,
    max_contacts: 5_000,
    lead_api_requests_per_day: 5_000,
    features: TierFeatures {
        sms_campaigns: true,
        ai_generation: true,
        api_access: true,
        priority_support: false,
    },
};

const PRO_LIMITS: TierLimits = TierLimits {
    max_emails: 100_000,
    max_sms: 10_000,
    max_contacts: 25_000,
    lead_api_requests_per_day: 20_000,
    features: TierFeatures {
        sms_campaigns: true,
        ai_generation: true,
        api_access: true,
        priority_support: true,
    },
};

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Starter,
        SubscriptionTier::Growth,
        SubscriptionTier::Pro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Growth => "growth",
            SubscriptionTier::Pro => "pro",
        }
    }

    pub fn limits(&self) -> &'static TierLimits {
        match self {
            SubscriptionTier::Free => &FREE_LIMITS,
            SubscriptionTier::Starter => &STARTER_LIMITS,
            SubscriptionTier::Growth => &GROWTH_LIMITS,
            SubscriptionTier::Pro => &PRO_LIMITS,
        }
    }

    /// Base allowance per credit type for one billing period
    pub fn allowance(&self) -> CreditAmounts {
        let limits = self.limits();
        CreditAmounts {
            emails: limits.max_emails,
            sms: limits.max_sms,
            leads: limits.max_contacts,
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "starter" => Ok(SubscriptionTier::Starter),
            "growth" => Ok(SubscriptionTier::Growth),
            "pro" => Ok(SubscriptionTier::Pro),
            _ => Err(ParseEnumError::new("subscription tier", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Whether the account's allowance renews at period end
    pub fn renews(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" | "trialing" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

// =============================================================================
// Credits
// =============================================================================

/// A consumable allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditType {
    Emails,
    Sms,
    Leads,
}

impl CreditType {
    pub const ALL: [CreditType; 3] = [CreditType::Emails, CreditType::Sms, CreditType::Leads];

    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Emails => "emails",
            CreditType::Sms => "sms",
            CreditType::Leads => "leads",
        }
    }
}

impl fmt::Display for CreditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditType {
    type Err = ParseEnumError;

    /// Accepts the canonical names plus the singular and `extra*` spellings
    /// that older clients still send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emails" | "email" | "extraemails" => Ok(CreditType::Emails),
            "sms" | "extrasms" => Ok(CreditType::Sms),
            "leads" | "lead" | "contacts" | "extraleads" => Ok(CreditType::Leads),
            _ => Err(ParseEnumError::new("credit type", s)),
        }
    }
}

/// One quantity per credit type
///
/// Used for requests ("consume 100 emails"), balances and log deltas alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditAmounts {
    pub emails: i64,
    pub sms: i64,
    pub leads: i64,
}

impl CreditAmounts {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn single(credit_type: CreditType, amount: i64) -> Self {
        let mut amounts = Self::zero();
        amounts.set(credit_type, amount);
        amounts
    }

    pub fn get(&self, credit_type: CreditType) -> i64 {
        match credit_type {
            CreditType::Emails => self.emails,
            CreditType::Sms => self.sms,
            CreditType::Leads => self.leads,
        }
    }

    pub fn set(&mut self, credit_type: CreditType, amount: i64) {
        match credit_type {
            CreditType::Emails => self.emails = amount,
            CreditType::Sms => self.sms = amount,
            CreditType::Leads => self.leads = amount,
        }
    }

    pub fn is_zero(&self) -> bool {
        CreditType::ALL.iter().all(|t| self.get(*t) == 0)
    }

    /// First credit type holding a negative amount, if any
    pub fn first_negative(&self) -> Option<CreditType> {
        CreditType::ALL.into_iter().find(|t| self.get(*t) < 0)
    }

    /// Non-zero entries in canonical order
    pub fn non_zero(&self) -> impl Iterator<Item = (CreditType, i64)> + '_ {
        CreditType::ALL
            .into_iter()
            .map(|t| (t, self.get(t)))
            .filter(|(_, amount)| *amount != 0)
    }

    pub fn negated(&self) -> Self {
        Self {
            emails: -self.emails,
            sms: -self.sms,
            leads: -self.leads,
        }
    }
}

// =============================================================================
// Campaigns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Sending,
    Sent,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    /// Allowed successor states
    pub fn successors(&self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            Draft => &[Scheduled, Active],
            Scheduled => &[Draft, Active, Failed],
            Active => &[Paused, Sending, Completed, Failed],
            Paused => &[Active, Completed],
            Sending => &[Sent, Failed],
            Sent => &[Completed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use CampaignStatus::*;
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Draft),
            "scheduled" => Ok(Scheduled),
            "active" => Ok(Active),
            "paused" => Ok(Paused),
            "sending" => Ok(Sending),
            "sent" => Ok(Sent),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            _ => Err(ParseEnumError::new("campaign status", s)),
        }
    }
}

/// Delivery channel of a campaign; decides which credit it spends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignChannel {
    Email,
    Sms,
}

impl CampaignChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignChannel::Email => "email",
            CampaignChannel::Sms => "sms",
        }
    }

    pub fn credit_type(&self) -> CreditType {
        match self {
            CampaignChannel::Email => CreditType::Emails,
            CampaignChannel::Sms => CreditType::Sms,
        }
    }
}

impl FromStr for CampaignChannel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(CampaignChannel::Email),
            "sms" => Ok(CampaignChannel::Sms),
            _ => Err(ParseEnumError::new("campaign channel", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in SubscriptionTier::ALL {
            assert_eq!(tier.as_str().parse::<SubscriptionTier>().unwrap(), tier);
        }
        assert!("enterprise".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_free_tier_allowance() {
        let allowance = SubscriptionTier::Free.allowance();
        assert_eq!(allowance.emails, 250);
        assert_eq!(allowance.sms, 0);
        assert_eq!(allowance.leads, 50);
        assert!(!SubscriptionTier::Free.limits().features.api_access);
    }

    #[test]
    fn test_tier_limits_increase_with_tier() {
        let mut previous: Option<&TierLimits> = None;
        for tier in SubscriptionTier::ALL {
            let limits = tier.limits();
            if let Some(prev) = previous {
                assert!(limits.max_emails > prev.max_emails);
                assert!(limits.max_contacts > prev.max_contacts);
                assert!(limits.lead_api_requests_per_day > prev.lead_api_requests_per_day);
            }
            previous = Some(limits);
        }
    }

    #[test]
    fn test_credit_type_accepts_legacy_names() {
        assert_eq!("extraEmails".parse::<CreditType>().unwrap(), CreditType::Emails);
        assert_eq!("email".parse::<CreditType>().unwrap(), CreditType::Emails);
        assert_eq!("SMS".parse::<CreditType>().unwrap(), CreditType::Sms);
        assert_eq!("contacts".parse::<CreditType>().unwrap(), CreditType::Leads);
        assert!("tokens".parse::<CreditType>().is_err());
    }

    #[test]
    fn test_credit_amounts_accessors() {
        let mut amounts = CreditAmounts::single(CreditType::Sms, 7);
        assert_eq!(amounts.get(CreditType::Sms), 7);
        assert!(!amounts.is_zero());
        amounts.set(CreditType::Leads, -1);
        assert_eq!(amounts.first_negative(), Some(CreditType::Leads));
        let entries: Vec<_> = amounts.non_zero().collect();
        assert_eq!(entries, vec![(CreditType::Sms, 7), (CreditType::Leads, -1)]);
        assert_eq!(amounts.negated().sms, -7);
    }

    #[test]
    fn test_credit_amounts_missing_fields_default_to_zero() {
        let amounts: CreditAmounts = serde_json::from_str(r#"{"emails": 100}"#).unwrap();
        assert_eq!(amounts, CreditAmounts::single(CreditType::Emails, 100));
    }

    #[test]
    fn test_campaign_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Completed));
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_channel_credit_type() {
        assert_eq!(CampaignChannel::Email.credit_type(), CreditType::Emails);
        assert_eq!(CampaignChannel::Sms.credit_type(), CreditType::Sms);
    }
}
