//! Domain events exchanged between the storefront services.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Menu items. Drinks go to the barista, food to the kitchen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    Cappuccino,
    CoffeeBlack,
    CoffeeWithRoom,
    Espresso,
    EspressoDouble,
    Latte,
    #[serde(rename = "CAKEPOP")]
    CakePop,
    Croissant,
    Muffin,
    CroissantChocolate,
}

/// Who prepares an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Station {
    Barista,
    Kitchen,
}

impl Station {
    pub fn as_str(&self) -> &'static str {
        match self {
            Station::Barista => "barista",
            Station::Kitchen => "kitchen",
        }
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ItemType {
    pub const ALL: [ItemType; 10] = [
        ItemType::Cappuccino,
        ItemType::CoffeeBlack,
        ItemType::CoffeeWithRoom,
        ItemType::Espresso,
        ItemType::EspressoDouble,
        ItemType::Latte,
        ItemType::CakePop,
        ItemType::Croissant,
        ItemType::Muffin,
        ItemType::CroissantChocolate,
    ];

    pub fn station(&self) -> Station {
        match self {
            ItemType::Cappuccino
            | ItemType::CoffeeBlack
            | ItemType::CoffeeWithRoom
            | ItemType::Espresso
            | ItemType::EspressoDouble
            | ItemType::Latte => Station::Barista,
            ItemType::CakePop
            | ItemType::Croissant
            | ItemType::Muffin
            | ItemType::CroissantChocolate => Station::Kitchen,
        }
    }

    /// Display name on the order board.
    pub fn name(&self) -> &'static str {
        match self {
            ItemType::Cappuccino => "CAPPUCCINO",
            ItemType::CoffeeBlack => "COFFEE_BLACK",
            ItemType::CoffeeWithRoom => "COFFEE_WITH_ROOM",
            ItemType::Espresso => "ESPRESSO",
            ItemType::EspressoDouble => "ESPRESSO_DOUBLE",
            ItemType::Latte => "LATTE",
            ItemType::CakePop => "CAKEPOP",
            ItemType::Croissant => "CROISSANT",
            ItemType::Muffin => "MUFFIN",
            ItemType::CroissantChocolate => "CROISSANT_CHOCOLATE",
        }
    }

    /// Nominal preparation time.
    pub fn prep_time(&self) -> Duration {
        let secs = match self {
            ItemType::Cappuccino
            | ItemType::CoffeeBlack
            | ItemType::CoffeeWithRoom
            | ItemType::CakePop => 5,
            ItemType::Espresso
            | ItemType::EspressoDouble
            | ItemType::Latte
            | ItemType::Croissant
            | ItemType::Muffin
            | ItemType::CroissantChocolate => 7,
        };
        Duration::from_secs(secs)
    }
}

/// A drink line item sent to the barista.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaristaOrderPlaced {
    pub order_id: Uuid,
    pub item_line_id: Uuid,
    pub item_type: ItemType,
    pub created_at: DateTime<Utc>,
}

/// A food line item sent to the kitchen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitchenOrderPlaced {
    pub order_id: Uuid,
    pub item_line_id: Uuid,
    pub item_type: ItemType,
    pub created_at: DateTime<Utc>,
}

/// A line item finished by a station, sent to the counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUp {
    pub order_id: Uuid,
    pub item_line_id: Uuid,
    pub name: String,
    pub item_type: ItemType,
    pub made_by: String,
    pub time_in: DateTime<Utc>,
    pub time_up: DateTime<Utc>,
}
