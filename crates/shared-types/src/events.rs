//! # Trading Events
//!
//! Defines the typed domain payloads that flow through the bus.
//!
//! Decimal quantities (sizes, prices, rates, amounts) travel as strings so
//! no service ever rounds them through floating point.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known stream names.
pub mod streams {
    /// Orders submitted for execution.
    pub const ORDER_REQUEST: &str = "order.request";
    /// Order lifecycle changes (fills, cancels, rejects).
    pub const ORDER_UPDATE: &str = "order.update";
    /// Position snapshots after every change.
    pub const POSITION_UPDATE: &str = "position.update";
    /// Mark/oracle price ticks. High frequency.
    pub const PRICE_UPDATE: &str = "price.update";
    /// Funding rate settlements.
    pub const FUNDING_RATE: &str = "funding.rate";
    /// Settled ledger transactions.
    pub const TRANSACTION: &str = "transaction.event";
}

/// A payload bound to its stream.
///
/// Implemented by every typed event so producers can publish without
/// repeating stream names at call sites.
pub trait BusEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stream this event is appended to.
    const STREAM: &'static str;

    /// Value of the envelope `type` field.
    const EVENT_TYPE: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Trade,
    Funding,
    Liquidation,
}

/// An order submitted for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: String,
    pub account: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: String,
    /// Required for limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl BusEvent for OrderRequest {
    const STREAM: &'static str = streams::ORDER_REQUEST;
    const EVENT_TYPE: &'static str = "order.request";
}

/// A change in an order's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BusEvent for OrderUpdate {
    const STREAM: &'static str = streams::ORDER_UPDATE;
    const EVENT_TYPE: &'static str = "order.update";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub account: String,
    pub market: String,
    /// Signed size: negative for shorts.
    pub size: String,
    pub entry_price: String,
    pub unrealized_pnl: String,
}

impl BusEvent for PositionUpdate {
    const STREAM: &'static str = streams::POSITION_UPDATE;
    const EVENT_TYPE: &'static str = "position.update";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub market: String,
    pub price: String,
    pub source: String,
    /// Provider timestamp, milliseconds since the epoch.
    pub publish_time: u64,
}

impl BusEvent for PriceUpdate {
    const STREAM: &'static str = streams::PRICE_UPDATE;
    const EVENT_TYPE: &'static str = "price.update";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRate {
    pub market: String,
    pub rate: String,
    /// Start of the funding interval, milliseconds since the epoch.
    pub interval_start: u64,
}

impl BusEvent for FundingRate {
    const STREAM: &'static str = streams::FUNDING_RATE;
    const EVENT_TYPE: &'static str = "funding.rate";
}

/// A settled ledger movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub tx_id: String,
    pub account: String,
    pub kind: TransactionKind,
    pub amount: String,
    /// Chain slot or ledger sequence the movement settled in.
    pub sequence: u64,
}

impl BusEvent for TransactionEvent {
    const STREAM: &'static str = streams::TRANSACTION;
    const EVENT_TYPE: &'static str = "transaction.event";
}
