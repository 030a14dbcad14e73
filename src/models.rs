use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Entity;
use crate::token::Role;

/// Bookkeeping shared by every stored row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for Record {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A staff account.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    #[serde(flatten)]
    pub record: Record,
    pub name: String,
    pub email: String,
    /// Encoded password hash; never part of an API response.
    #[serde(rename = "password")]
    pub password_hash: String,
    pub role: Role,
    pub store_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Store {
    #[serde(flatten)]
    pub record: Record,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Customer {
    #[serde(flatten)]
    pub record: Record,
    pub last_name: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name_kana: String,
    #[serde(default)]
    pub first_name_kana: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub pref_name: String,
    #[serde(default)]
    pub address1: String,
    #[serde(default)]
    pub address2: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub phone: String,
    pub store_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    #[serde(flatten)]
    pub record: Record,
    pub name: String,
    pub price: i64,
    /// Visits one purchase grants; 1 for single-use services.
    pub total_count: u32,
    pub store_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ticket {
    #[serde(flatten)]
    pub record: Record,
    pub customer_id: u64,
    pub course_id: u64,
    pub store_id: u64,
    /// Copied from the course when the ticket is opened.
    pub total_count: u32,
    pub current_count: u32,
    pub is_completed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Visit {
    #[serde(flatten)]
    pub record: Record,
    pub customer_id: u64,
    pub course_id: u64,
    pub ticket_id: Option<u64>,
    /// Position of this visit within its ticket.
    pub visit_count: u32,
    pub store_id: u64,
    #[serde(default)]
    pub memo: String,
}

macro_rules! impl_entity {
    ($($ty:ty => $tree:literal),+ $(,)?) => {
        $(
            impl Entity for $ty {
                const TREE: &'static str = $tree;

                fn record(&self) -> &Record {
                    &self.record
                }

                fn record_mut(&mut self) -> &mut Record {
                    &mut self.record
                }
            }
        )+
    };
}

impl_entity! {
    User => "users",
    Store => "stores",
    Customer => "customers",
    Course => "courses",
    Ticket => "tickets",
    Visit => "visits",
}

/// Public view of a [`User`], without the password hash.
#[derive(Serialize, Debug, Clone)]
pub struct UserView {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub store_id: u64,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.record.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            store_id: user.store_id,
        }
    }
}
