use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de::IgnoredAny};

use crate::{UtcDT, location::SharedLocation};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// Opaque identifier of an order record
pub struct OrderId(String);

impl OrderId {
    /// Parse an order id, blank strings mean "no active order" and give `None`
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A position field on the order, each role may only write its own
pub enum RoleField {
    #[serde(rename = "customerLocation")]
    Customer,
    #[serde(rename = "riderLocation")]
    Rider,
}

impl RoleField {
    pub const ALL: [Self; 2] = [Self::Customer, Self::Rider];

    /// Name of the field on the order record
    pub const fn field_name(self) -> &'static str {
        match self {
            Self::Customer => "customerLocation",
            Self::Rider => "riderLocation",
        }
    }

    pub fn from_field_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.field_name() == name)
    }

    /// The field of the other party on the same order
    pub const fn partner(self) -> Self {
        match self {
            Self::Customer => Self::Rider,
            Self::Rider => Self::Customer,
        }
    }
}

impl fmt::Display for RoleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    #[default]
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::InTransit,
        Self::Delivered,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InTransit => "in-transit",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientLocation {
    Valid(SharedLocation),
    Malformed(IgnoredAny),
}

/// A role field that doesn't parse is treated as not published yet
fn lenient_location<'de, D>(deserializer: D) -> Result<Option<SharedLocation>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<LenientLocation>::deserialize(deserializer)? {
        Some(LenientLocation::Valid(loc)) => Some(loc),
        Some(LenientLocation::Malformed(_)) | None => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// The full order record as delivered by the store on every change
pub struct OrderSnapshot {
    pub id: OrderId,
    #[serde(default)]
    pub status: OrderStatus,
    pub created_at: UtcDT,
    #[serde(
        default,
        deserialize_with = "lenient_location",
        skip_serializing_if = "Option::is_none"
    )]
    pub customer_location: Option<SharedLocation>,
    #[serde(
        default,
        deserialize_with = "lenient_location",
        skip_serializing_if = "Option::is_none"
    )]
    pub rider_location: Option<SharedLocation>,
}

impl OrderSnapshot {
    pub fn new(id: OrderId, created_at: UtcDT) -> Self {
        Self {
            id,
            status: OrderStatus::Pending,
            created_at,
            customer_location: None,
            rider_location: None,
        }
    }

    pub fn field(&self, field: RoleField) -> Option<&SharedLocation> {
        match field {
            RoleField::Customer => self.customer_location.as_ref(),
            RoleField::Rider => self.rider_location.as_ref(),
        }
    }

    pub fn field_mut(&mut self, field: RoleField) -> &mut Option<SharedLocation> {
        match field {
            RoleField::Customer => &mut self.customer_location,
            RoleField::Rider => &mut self.rider_location,
        }
    }
}
