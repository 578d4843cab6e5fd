//! Exchange, queue, routing key and message type names shared by the
//! storefront services.
//!
//! Every service reads its subscription and outbound stream from here so
//! producers and consumers cannot drift apart.

use crate::bus::{ConsumerConfig, PublisherConfig};

pub const BARISTA_ORDER_EXCHANGE: &str = "barista-order-exchange";
pub const BARISTA_ORDER_QUEUE: &str = "barista-order-queue";
pub const BARISTA_ORDER_ROUTING_KEY: &str = "barista-order-routing-key";
pub const BARISTA_ORDER_CONSUMER: &str = "barista-order-consumer";
pub const BARISTA_ORDER_PLACED: &str = "barista-order-placed";
pub const BARISTA_ORDER_UPDATED: &str = "barista-order-updated";

pub const KITCHEN_ORDER_EXCHANGE: &str = "kitchen-order-exchange";
pub const KITCHEN_ORDER_QUEUE: &str = "kitchen-order-queue";
pub const KITCHEN_ORDER_ROUTING_KEY: &str = "kitchen-order-routing-key";
pub const KITCHEN_ORDER_CONSUMER: &str = "kitchen-order-consumer";
pub const KITCHEN_ORDER_PLACED: &str = "kitchen-order-placed";
pub const KITCHEN_ORDER_UPDATED: &str = "kitchen-order-updated";

pub const COUNTER_ORDER_EXCHANGE: &str = "counter-order-exchange";
pub const COUNTER_ORDER_QUEUE: &str = "counter-order-queue";
pub const COUNTER_ORDER_ROUTING_KEY: &str = "counter-order-routing-key";
pub const COUNTER_ORDER_CONSUMER: &str = "counter-order-consumer";

/// Barista: drink orders in.
pub fn barista_orders() -> ConsumerConfig {
    ConsumerConfig::new(
        BARISTA_ORDER_EXCHANGE,
        BARISTA_ORDER_QUEUE,
        BARISTA_ORDER_ROUTING_KEY,
        BARISTA_ORDER_CONSUMER,
    )
}

/// Barista: finished drinks out to the counter.
pub fn barista_updates() -> PublisherConfig {
    PublisherConfig::new(
        COUNTER_ORDER_EXCHANGE,
        COUNTER_ORDER_ROUTING_KEY,
        BARISTA_ORDER_UPDATED,
    )
}

/// Kitchen: food orders in.
pub fn kitchen_orders() -> ConsumerConfig {
    ConsumerConfig::new(
        KITCHEN_ORDER_EXCHANGE,
        KITCHEN_ORDER_QUEUE,
        KITCHEN_ORDER_ROUTING_KEY,
        KITCHEN_ORDER_CONSUMER,
    )
}

/// Kitchen: finished food out to the counter.
pub fn kitchen_updates() -> PublisherConfig {
    PublisherConfig::new(
        COUNTER_ORDER_EXCHANGE,
        COUNTER_ORDER_ROUTING_KEY,
        KITCHEN_ORDER_UPDATED,
    )
}

/// Counter: finished items from both stations.
pub fn counter_updates() -> ConsumerConfig {
    ConsumerConfig::new(
        COUNTER_ORDER_EXCHANGE,
        COUNTER_ORDER_QUEUE,
        COUNTER_ORDER_ROUTING_KEY,
        COUNTER_ORDER_CONSUMER,
    )
}

/// Order intake: drink orders to the barista.
pub fn barista_placements() -> PublisherConfig {
    PublisherConfig::new(
        BARISTA_ORDER_EXCHANGE,
        BARISTA_ORDER_ROUTING_KEY,
        BARISTA_ORDER_PLACED,
    )
}

/// Order intake: food orders to the kitchen.
pub fn kitchen_placements() -> PublisherConfig {
    PublisherConfig::new(
        KITCHEN_ORDER_EXCHANGE,
        KITCHEN_ORDER_ROUTING_KEY,
        KITCHEN_ORDER_PLACED,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::topic_matches;

    #[test]
    fn test_all_topology_is_valid() {
        for consumer in [barista_orders(), kitchen_orders(), counter_updates()] {
            consumer.validate().unwrap();
        }
        for publisher in [
            barista_updates(),
            kitchen_updates(),
            barista_placements(),
            kitchen_placements(),
        ] {
            publisher.validate().unwrap();
        }
    }

    #[test]
    fn test_publishers_reach_their_consumers() {
        let pairs = [
            (barista_placements(), barista_orders()),
            (kitchen_placements(), kitchen_orders()),
            (barista_updates(), counter_updates()),
            (kitchen_updates(), counter_updates()),
        ];
        for (publisher, consumer) in pairs {
            assert_eq!(publisher.exchange, consumer.exchange);
            assert!(topic_matches(&consumer.binding_key, &publisher.binding_key));
        }
    }

    #[test]
    fn test_stations_do_not_cross() {
        assert!(!topic_matches(
            &kitchen_orders().binding_key,
            &barista_placements().binding_key
        ));
        assert_ne!(barista_placements().exchange, kitchen_orders().exchange);
    }
}
