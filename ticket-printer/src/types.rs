//! Ticket printing types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Customer block of a ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCustomer {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// One ordered product
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    #[serde(default)]
    pub addon_labels: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl TicketLineItem {
    /// Line total (unit price x quantity), `None` on overflow
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

/// An order as handed over by the order-management layer
///
/// Amounts arrive already computed; the printer never re-prices an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketOrder {
    pub order_id: String,
    pub order_kind_label: String,
    pub customer: TicketCustomer,
    pub line_items: Vec<TicketLineItem>,
    pub subtotal: Decimal,
    pub delivery_charge: Decimal,
    pub total: Decimal,
    pub payment_method_label: String,
    pub is_paid: bool,
    pub placed_at_label: String,
    pub support_phone: String,
}

/// Restaurant identity printed under the order-kind header
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreIdentity {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub extra_lines: Vec<String>,
}

/// Fixed captions printed on a ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLabels {
    pub order: String,
    pub customer: String,
    pub phone: String,
    pub address: String,
    pub subtotal: String,
    pub delivery: String,
    pub total: String,
    pub paid: String,
    pub not_paid: String,
    pub support: String,
    pub test_title: String,
    pub test_body: String,
}

impl Default for TicketLabels {
    fn default() -> Self {
        Self {
            order: "Order".into(),
            customer: "Customer".into(),
            phone: "Phone".into(),
            address: "Address".into(),
            subtotal: "Subtotal".into(),
            delivery: "Delivery".into(),
            total: "TOTAL".into(),
            paid: "PAID".into(),
            not_paid: "NOT PAID".into(),
            support: "Support".into(),
            test_title: "PRINTER TEST".into(),
            test_body: "If you can read this, the printer is connected.".into(),
        }
    }
}
