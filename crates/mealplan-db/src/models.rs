use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Error returned when a stored or user-supplied string does not name a
/// variant of one of the text-backed enums below.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a text-backed enum with `Display`, `FromStr`, `as_str` and the
/// sqlx/serde mappings shared by every status column.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[sqlx(type_name = "text", rename_all = "snake_case")]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle status of a meal plan.
    PlanStatus, "plan status" {
        AwaitingVotes => "awaiting_votes",
        Finalized => "finalized",
        GroceryListInitialized => "grocery_list_initialized",
        PrepTasksGenerated => "prep_tasks_generated",
        Complete => "complete",
        Archived => "archived",
    }
}

impl PlanStatus {
    /// Whether votes have been tallied for this plan.
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            Self::Finalized | Self::GroceryListInitialized | Self::PrepTasksGenerated | Self::Complete
        )
    }
}

text_enum! {
    /// Status of a single meal plan event.
    EventStatus, "event status" {
        AwaitingVotes => "awaiting_votes",
        Finalized => "finalized",
    }
}

text_enum! {
    /// Which meal of the day an event is.
    MealName, "meal name" {
        Breakfast => "breakfast",
        Lunch => "lunch",
        Dinner => "dinner",
        Snack => "snack",
    }
}

text_enum! {
    /// Outcome of the vote for one option.
    OptionChoice, "option choice" {
        Unknown => "unknown",
        Winner => "winner",
        Loser => "loser",
    }
}

text_enum! {
    /// Shopping status of a grocery list line.
    GroceryItemStatus, "grocery item status" {
        Unknown => "unknown",
        Needed => "needed",
        AlreadyOwned => "already_owned",
        Acquired => "acquired",
        Substituted => "substituted",
    }
}

text_enum! {
    /// Status of a prep task.
    PrepTaskStatus, "prep task status" {
        Unfinished => "unfinished",
        InProgress => "in_progress",
        Ignored => "ignored",
        Postponed => "postponed",
        Finished => "finished",
    }
}

text_enum! {
    /// Physical dimension a measurement unit measures.
    UnitDimension, "unit dimension" {
        Mass => "mass",
        Volume => "volume",
        Count => "count",
        Other => "other",
    }
}

// ---------------------------------------------------------------------------
// Plan rows
// ---------------------------------------------------------------------------

/// A household's meal plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlan {
    pub id: Uuid,
    pub household_id: Uuid,
    pub created_by_user_id: Uuid,
    pub notes: String,
    pub voting_deadline: DateTime<Utc>,
    pub status: PlanStatus,
    pub finalized_at: Option<DateTime<Utc>>,
    pub grocery_list_initialized_at: Option<DateTime<Utc>>,
    pub tasks_created_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// One meal occurrence within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanEvent {
    pub id: Uuid,
    pub meal_plan_id: Uuid,
    pub meal_name: MealName,
    pub notes: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// A candidate meal for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanOption {
    pub id: Uuid,
    pub meal_plan_event_id: Uuid,
    pub meal_id: Uuid,
    pub assigned_cook_user_id: Option<Uuid>,
    pub notes: String,
    pub chosen: OptionChoice,
    pub tiebroken: bool,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// One cell of a user's ranked ballot: the rank they gave one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanOptionVote {
    pub id: Uuid,
    pub meal_plan_event_id: Uuid,
    pub meal_plan_option_id: Uuid,
    pub by_user_id: Uuid,
    pub rank: i32,
    pub created_at: DateTime<Utc>,
}

/// An aggregated shopping line derived from the winning recipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct GroceryListItem {
    pub id: Uuid,
    pub meal_plan_id: Uuid,
    pub ingredient_id: Uuid,
    pub measurement_unit_id: Uuid,
    pub min_quantity: Decimal,
    pub max_quantity: Option<Decimal>,
    pub status: GroceryItemStatus,
    pub status_explanation: String,
    pub purchased_quantity: Option<Decimal>,
    pub purchased_measurement_unit_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub purchased_upc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// A dated unit of preparation work for a winning recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PrepTask {
    pub id: Uuid,
    pub meal_plan_id: Uuid,
    pub meal_plan_option_id: Uuid,
    pub recipe_id: Uuid,
    pub recipe_prep_task_template_id: Uuid,
    pub assigned_to_user_id: Option<Uuid>,
    pub cannot_complete_before: DateTime<Utc>,
    pub cannot_complete_after: DateTime<Utc>,
    pub status: PrepTaskStatus,
    pub status_explanation: String,
    pub creation_explanation: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A published domain event waiting for (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub idempotency_key: String,
    pub meal_plan_id: Option<Uuid>,
    pub household_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Reference rows (read only)
// ---------------------------------------------------------------------------

/// A household as mirrored from the household service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Household {
    pub id: Uuid,
    pub name: String,
    pub owner_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A measurement unit from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MeasurementUnit {
    pub id: Uuid,
    pub name: String,
    pub dimension: UnitDimension,
    pub is_base: bool,
}

/// A registered conversion into another unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UnitConversion {
    pub from_unit_id: Uuid,
    pub to_unit_id: Uuid,
    pub only_for_ingredient: Option<Uuid>,
    pub modifier: Decimal,
}

/// An ingredient line of a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeIngredient {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub ingredient_id: Uuid,
    pub measurement_unit_id: Uuid,
    pub min_quantity: Decimal,
    pub max_quantity: Option<Decimal>,
}

/// A prep-task template attached to a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PrepTaskTemplate {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub name: String,
    pub offset_before_seconds: i64,
    pub duration_estimate_seconds: i64,
    pub storage_requirement: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
