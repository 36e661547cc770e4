//! Domain types shared by the orchestrator, the preference store and the
//! collaborator ports.
//!
//! A *logical* slot (`SlotId`, also called the subscription id) indexes the
//! orchestrator's state table. A *physical* slot indexes the card reader.
//! They are usually 1:1 but the types keep them apart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical subscription slot, `0..slot_count`.
pub type SlotId = usize;

// ── Application type ────────────────────────────────────────────────

/// Type of a UICC application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppType {
    #[default]
    Unknown,
    Sim,
    Usim,
    Ruim,
    Csim,
    Isim,
}

impl AppType {
    /// SIM/USIM applications (GSM/UMTS/LTE family).
    pub fn is_3gpp(self) -> bool {
        matches!(self, AppType::Sim | AppType::Usim)
    }

    /// RUIM/CSIM applications (CDMA family).
    pub fn is_3gpp2(self) -> bool {
        matches!(self, AppType::Ruim | AppType::Csim)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Unknown => "UNKNOWN",
            AppType::Sim => "SIM",
            AppType::Usim => "USIM",
            AppType::Ruim => "RUIM",
            AppType::Csim => "CSIM",
            AppType::Isim => "ISIM",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" | "" => Ok(AppType::Unknown),
            "SIM" => Ok(AppType::Sim),
            "USIM" => Ok(AppType::Usim),
            "RUIM" => Ok(AppType::Ruim),
            "CSIM" => Ok(AppType::Csim),
            "ISIM" => Ok(AppType::Isim),
            other => Err(format!("unknown app type: {other}")),
        }
    }
}

// ── Subscription status ─────────────────────────────────────────────

/// Activation status of a subscription.
///
/// `Activate` and `Deactivate` are the in-flight (pending) states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Invalid,
    Deactivated,
    Deactivate,
    Activated,
    Activate,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Invalid => "INVALID",
            SubscriptionStatus::Deactivated => "DEACTIVATED",
            SubscriptionStatus::Deactivate => "DEACTIVATE",
            SubscriptionStatus::Activated => "ACTIVATED",
            SubscriptionStatus::Activate => "ACTIVATE",
        }
    }

    /// The direction a caller asks for when it puts this status in a
    /// desired subscription. `Invalid` asks for nothing.
    pub fn desired_direction(self) -> Option<Direction> {
        match self {
            SubscriptionStatus::Activate | SubscriptionStatus::Activated => {
                Some(Direction::Activate)
            }
            SubscriptionStatus::Deactivate | SubscriptionStatus::Deactivated => {
                Some(Direction::Deactivate)
            }
            SubscriptionStatus::Invalid => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INVALID" => Ok(SubscriptionStatus::Invalid),
            "DEACTIVATED" => Ok(SubscriptionStatus::Deactivated),
            "DEACTIVATE" => Ok(SubscriptionStatus::Deactivate),
            "ACTIVATED" => Ok(SubscriptionStatus::Activated),
            "ACTIVATE" => Ok(SubscriptionStatus::Activate),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Direction of a UICC subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Activate,
    Deactivate,
}

impl Direction {
    /// Status a subscription carries while a command in this direction is pending.
    pub fn pending_status(self) -> SubscriptionStatus {
        match self {
            Direction::Activate => SubscriptionStatus::Activate,
            Direction::Deactivate => SubscriptionStatus::Deactivate,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Activate => write!(f, "activate"),
            Direction::Deactivate => write!(f, "deactivate"),
        }
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// One UICC application bound to one logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Logical slot this subscription occupies.
    pub sub_id: SlotId,
    /// Physical card slot the application lives on.
    pub slot_id: Option<usize>,
    /// Index of the application on the card.
    pub app_index: Option<usize>,
    pub icc_id: Option<String>,
    pub app_type: AppType,
    pub app_id: Option<String>,
    pub status: SubscriptionStatus,
}

impl Subscription {
    /// A slot with nothing bound to it.
    pub fn empty(sub_id: SlotId) -> Self {
        Self {
            sub_id,
            slot_id: None,
            app_index: None,
            icc_id: None,
            app_type: AppType::Unknown,
            app_id: None,
            status: SubscriptionStatus::Deactivated,
        }
    }

    /// Subscription for application `app_index` of the card in `slot_id`.
    pub fn for_app(
        sub_id: SlotId,
        slot_id: usize,
        app_index: usize,
        card: &CardInfo,
        status: SubscriptionStatus,
    ) -> Self {
        let app = card.apps.get(app_index);
        Self {
            sub_id,
            slot_id: Some(slot_id),
            app_index: Some(app_index),
            icc_id: card.icc_id.clone(),
            app_type: app.map(|a| a.app_type).unwrap_or_default(),
            app_id: app.map(|a| a.app_id.clone()),
            status,
        }
    }

    pub fn with_status(&self, status: SubscriptionStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Same card application, ignoring status.
    pub fn is_same_app(&self, other: &Subscription) -> bool {
        self.slot_id == other.slot_id
            && self.app_index == other.app_index
            && self.icc_id == other.icc_id
    }

    /// Whether this subscription is bound to the card in `card_slot`.
    pub fn lives_on(&self, card_slot: usize) -> bool {
        self.slot_id == Some(card_slot)
    }
}

/// Desired subscription set handed to `set_subscription`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionData {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self { subscriptions }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

// ── Card inventory ──────────────────────────────────────────────────

/// One application reported by the card inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub app_type: AppType,
    /// Application identifier (AID), hex encoded.
    pub app_id: String,
}

/// What the card inventory knows about one physical slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub icc_id: Option<String>,
    pub apps: Vec<AppDescriptor>,
}

impl CardInfo {
    /// Default application for a new card: first 3GPP app, else first 3GPP2 app.
    pub fn default_app_index(&self) -> Option<usize> {
        self.apps
            .iter()
            .position(|a| a.app_type.is_3gpp())
            .or_else(|| self.apps.iter().position(|a| a.app_type.is_3gpp2()))
    }
}

/// Why card info went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardUnavailableReason {
    RadioUnavailable,
    SimRefreshReset,
    CardRemoved,
}

impl fmt::Display for CardUnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardUnavailableReason::RadioUnavailable => write!(f, "radio_unavailable"),
            CardUnavailableReason::SimRefreshReset => write!(f, "sim_refresh_reset"),
            CardUnavailableReason::CardRemoved => write!(f, "card_removed"),
        }
    }
}

// ── Transition cause ────────────────────────────────────────────────

/// Outcome of the last transition of a slot, surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cause {
    #[serde(rename = "ACTIVATE SUCCESS")]
    ActivateSuccess,
    #[serde(rename = "ACTIVATE FAILED")]
    ActivateFailed,
    #[serde(rename = "ACTIVATE NOT SUPPORTED")]
    ActivateNotSupported,
    #[serde(rename = "DEACTIVATE SUCCESS")]
    DeactivateSuccess,
    #[serde(rename = "DEACTIVATE FAILED")]
    DeactivateFailed,
    #[serde(rename = "DEACTIVATE NOT SUPPORTED")]
    DeactivateNotSupported,
    #[serde(rename = "SUBSCRIPTION INVALID")]
    SubscriptionInvalid,
    #[serde(rename = "NO CHANGE")]
    NoChange,
    #[serde(rename = "CARD UNAVAILABLE")]
    CardUnavailable,
    #[serde(rename = "RADIO OFF")]
    RadioOff,
    #[serde(rename = "MODEM DEACTIVATED")]
    ModemDeactivated,
}

impl Cause {
    pub fn as_str(self) -> &'static str {
        match self {
            Cause::ActivateSuccess => "ACTIVATE SUCCESS",
            Cause::ActivateFailed => "ACTIVATE FAILED",
            Cause::ActivateNotSupported => "ACTIVATE NOT SUPPORTED",
            Cause::DeactivateSuccess => "DEACTIVATE SUCCESS",
            Cause::DeactivateFailed => "DEACTIVATE FAILED",
            Cause::DeactivateNotSupported => "DEACTIVATE NOT SUPPORTED",
            Cause::SubscriptionInvalid => "SUBSCRIPTION INVALID",
            Cause::NoChange => "NO CHANGE",
            Cause::CardUnavailable => "CARD UNAVAILABLE",
            Cause::RadioOff => "RADIO OFF",
            Cause::ModemDeactivated => "MODEM DEACTIVATED",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            Cause::ActivateSuccess | Cause::DeactivateSuccess | Cause::NoChange
        )
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_app_card() -> CardInfo {
        CardInfo {
            icc_id: Some("8901260000000000001".into()),
            apps: vec![
                AppDescriptor {
                    app_type: AppType::Csim,
                    app_id: "A0000003431002".into(),
                },
                AppDescriptor {
                    app_type: AppType::Usim,
                    app_id: "A0000000871002".into(),
                },
            ],
        }
    }

    #[test]
    fn app_type_families() {
        assert!(AppType::Usim.is_3gpp());
        assert!(AppType::Sim.is_3gpp());
        assert!(AppType::Csim.is_3gpp2());
        assert!(!AppType::Isim.is_3gpp());
        assert!(!AppType::Isim.is_3gpp2());
    }

    #[test]
    fn app_type_parse_is_case_insensitive() {
        assert_eq!("usim".parse::<AppType>().unwrap(), AppType::Usim);
        assert_eq!("".parse::<AppType>().unwrap(), AppType::Unknown);
        assert!("ESIM".parse::<AppType>().is_err());
    }

    #[test]
    fn desired_direction_folds_pending_and_settled() {
        assert_eq!(
            SubscriptionStatus::Activated.desired_direction(),
            Some(Direction::Activate)
        );
        assert_eq!(
            SubscriptionStatus::Deactivate.desired_direction(),
            Some(Direction::Deactivate)
        );
        assert_eq!(SubscriptionStatus::Invalid.desired_direction(), None);
    }

    #[test]
    fn default_app_prefers_3gpp() {
        assert_eq!(dual_app_card().default_app_index(), Some(1));

        let cdma_only = CardInfo {
            icc_id: None,
            apps: vec![AppDescriptor {
                app_type: AppType::Ruim,
                app_id: "A000000343".into(),
            }],
        };
        assert_eq!(cdma_only.default_app_index(), Some(0));
        assert_eq!(CardInfo::default().default_app_index(), None);
    }

    #[test]
    fn subscription_for_app_copies_card_identity() {
        let card = dual_app_card();
        let sub = Subscription::for_app(0, 0, 1, &card, SubscriptionStatus::Activate);
        assert_eq!(sub.app_type, AppType::Usim);
        assert_eq!(sub.app_id.as_deref(), Some("A0000000871002"));
        assert_eq!(sub.icc_id, card.icc_id);
        assert!(sub.lives_on(0));
        assert!(!sub.lives_on(1));
    }

    #[test]
    fn same_app_ignores_status() {
        let card = dual_app_card();
        let a = Subscription::for_app(0, 0, 1, &card, SubscriptionStatus::Activated);
        let b = a.with_status(SubscriptionStatus::Deactivate);
        let c = Subscription::for_app(0, 0, 0, &card, SubscriptionStatus::Activated);
        assert!(a.is_same_app(&b));
        assert!(!a.is_same_app(&c));
    }

    #[test]
    fn cause_strings_match_serde_names() {
        for cause in [
            Cause::ActivateSuccess,
            Cause::DeactivateNotSupported,
            Cause::SubscriptionInvalid,
            Cause::ModemDeactivated,
        ] {
            let json = serde_json::to_string(&cause).unwrap();
            assert_eq!(json, format!("\"{}\"", cause.as_str()));
        }
    }
}
