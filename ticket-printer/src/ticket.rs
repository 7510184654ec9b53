//! Order ticket renderer
//!
//! Renders `TicketOrder` data into ESC/POS format for thermal printers.

use rust_decimal::Decimal;

use crate::encoding::{Codepage, wrap_words};
use crate::escpos::{CutMode, EscPosBuilder};
use crate::types::{StoreIdentity, TicketLabels, TicketLineItem, TicketOrder};

/// Default paper width (80mm paper)
pub const DEFAULT_PAGE_WIDTH: usize = 48;

const ADDON_PREFIX: &str = "  + ";
const COMMENT_PREFIX: &str = "  * ";
const CONTINUATION: &str = "    ";

/// Encode an order with the default layout
///
/// # Panics
///
/// Panics if `page_width` is zero.
pub fn encode_ticket(order: &TicketOrder, page_width: usize) -> Vec<u8> {
    TicketEncoder::new(page_width).encode(order)
}

/// Ticket renderer
///
/// Pure: the same order and settings always produce the same bytes.
#[derive(Debug, Clone)]
pub struct TicketEncoder {
    width: usize,
    store: StoreIdentity,
    labels: TicketLabels,
    codepage: Codepage,
    cut: CutMode,
    feed_lines: u8,
}

impl TicketEncoder {
    /// Create a renderer for the given paper width in characters
    ///
    /// # Panics
    ///
    /// Panics if `width` is zero.
    pub fn new(width: usize) -> Self {
        assert!(width >= 1, "page width must be at least 1 column");
        Self {
            width,
            store: StoreIdentity::default(),
            labels: TicketLabels::default(),
            codepage: Codepage::Utf8,
            cut: CutMode::Full,
            feed_lines: 3,
        }
    }

    pub fn with_store(mut self, store: StoreIdentity) -> Self {
        self.store = store;
        self
    }

    pub fn with_labels(mut self, labels: TicketLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_codepage(mut self, codepage: Codepage) -> Self {
        self.codepage = codepage;
        self
    }

    pub fn with_cut(mut self, cut: CutMode) -> Self {
        self.cut = cut;
        self
    }

    /// Lines fed before the cut so the last text clears the cutter
    pub fn with_feed_lines(mut self, lines: u8) -> Self {
        self.feed_lines = lines;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Render an order to ESC/POS bytes
    pub fn encode(&self, order: &TicketOrder) -> Vec<u8> {
        let mut b = EscPosBuilder::with_codepage(self.width, self.codepage);

        self.render_header(&mut b, order);
        self.render_store(&mut b);
        self.render_order_number(&mut b, order);
        self.render_customer(&mut b, order);

        for item in &order.line_items {
            self.render_item(&mut b, item);
        }
        b.sep_single();

        self.render_totals(&mut b, order);
        self.render_payment(&mut b, order);
        self.render_footer(&mut b, order);

        b.build()
    }

    /// Connectivity test page built from the primitive layer
    pub fn test_page(&self) -> Vec<u8> {
        let mut b = EscPosBuilder::with_codepage(self.width, self.codepage);

        b.center();
        b.double_size();
        b.bold(true);
        b.line(&self.labels.test_title);
        b.bold(false);
        b.reset_size();
        if !self.store.name.is_empty() {
            b.line(&self.store.name);
        }
        b.left();
        b.sep_double();

        for line in wrap_words(&self.labels.test_body, self.width) {
            b.line(&line);
        }
        b.line(&format!("{} cols", self.width));

        // Column ruler to check the configured width against the paper
        let ruler: String = (1..=self.width)
            .map(|i| char::from(b'0' + (i % 10) as u8))
            .collect();
        b.line(&ruler);

        b.feed(self.feed_lines);
        b.cut_with(self.cut);
        b.build()
    }

    /// Order kind (delivery, pickup, ...), large and centered
    fn render_header(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        b.center();
        b.double_size();
        b.bold(true);
        b.line(&order.order_kind_label);
        b.bold(false);
        b.reset_size();
    }

    fn render_store(&self, b: &mut EscPosBuilder) {
        if !self.store.name.is_empty() {
            b.bold(true);
            b.line(&self.store.name);
            b.bold(false);
        }
        if let Some(ref address) = self.store.address {
            for line in wrap_words(address, self.width) {
                b.line(&line);
            }
        }
        for extra in &self.store.extra_lines {
            b.line(extra);
        }
        b.newline();
    }

    fn render_order_number(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        b.double_height();
        b.bold(true);
        b.line(&format!("{} #{}", self.labels.order, order.order_id));
        b.bold(false);
        b.reset_size();
        b.line(&order.placed_at_label);

        b.left();
        b.sep_double();
    }

    fn render_customer(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        let customer = &order.customer;
        b.line(&format!("{}: {}", self.labels.customer, customer.name));
        b.line(&format!("{}: {}", self.labels.phone, customer.phone));

        if let Some(ref address) = customer.address
            && !address.trim().is_empty()
        {
            let text = format!("{}: {}", self.labels.address, address);
            for line in wrap_words(&text, self.width) {
                b.line(&line);
            }
        }
        b.sep_single();
    }

    /// Item line: "2x Cola" with the line total on the right
    fn render_item(&self, b: &mut EscPosBuilder, item: &TicketLineItem) {
        let label = format!("{}x {}", item.quantity, item.name);
        b.bold(true);
        match item.line_total() {
            Some(total) => b.line_lr(&label, &format_money(total)),
            None => b.line(&label),
        };
        b.bold(false);

        for addon in &item.addon_labels {
            self.indented(b, ADDON_PREFIX, addon);
        }

        if let Some(ref comment) = item.comment
            && !comment.trim().is_empty()
        {
            self.indented(b, COMMENT_PREFIX, comment);
        }
    }

    /// Wrap `text` under a prefix, continuation lines aligned with the text
    fn indented(&self, b: &mut EscPosBuilder, prefix: &str, text: &str) {
        // Too narrow to indent at all
        if self.width <= prefix.len() {
            for line in wrap_words(text, self.width) {
                b.line(&line);
            }
            return;
        }

        let inner = self.width - prefix.len();
        for (i, line) in wrap_words(text, inner).iter().enumerate() {
            let lead = if i == 0 { prefix } else { CONTINUATION };
            b.line(&format!("{}{}", lead, line));
        }
    }

    fn render_totals(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        b.line_lr(&self.labels.subtotal, &format_money(order.subtotal));
        b.line_lr(&self.labels.delivery, &format_money(order.delivery_charge));

        b.double_height();
        b.bold(true);
        b.line_lr(&self.labels.total, &format_money(order.total));
        b.bold(false);
        b.reset_size();
    }

    fn render_payment(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        let banner = if order.is_paid {
            &self.labels.paid
        } else {
            &self.labels.not_paid
        };

        b.newline();
        b.center();
        b.double_size();
        b.bold(true);
        b.line(banner);
        b.reset_size();
        b.line(&order.payment_method_label);
        b.bold(false);
    }

    fn render_footer(&self, b: &mut EscPosBuilder, order: &TicketOrder) {
        if !order.support_phone.is_empty() {
            b.newline();
            b.line(&format!("{}: {}", self.labels.support, order.support_phone));
        }
        b.left();

        // Feed and cut
        b.feed(self.feed_lines);
        b.cut_with(self.cut);
    }
}

impl Default for TicketEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_WIDTH)
    }
}

fn format_money(amount: Decimal) -> String {
    format!("{:.2}", amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketCustomer;

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn create_test_order() -> TicketOrder {
        TicketOrder {
            order_id: "1042".to_string(),
            order_kind_label: "DELIVERY".to_string(),
            customer: TicketCustomer {
                name: "Ivan Petrov".to_string(),
                phone: "+7 900 123-45-67".to_string(),
                address: Some("ул. Ленина 10, кв. 5, домофон 5К".to_string()),
            },
            line_items: vec![
                TicketLineItem {
                    name: "Pepperoni".to_string(),
                    quantity: 1,
                    unit_price: Decimal::new(1150, 2),
                    addon_labels: vec![
                        "Extra cheese".to_string(),
                        "Двойной соус барбекю с копчёным перцем и чесноком".to_string(),
                    ],
                    comment: Some("Cut into 8 slices please".to_string()),
                },
                TicketLineItem {
                    name: "Cola".to_string(),
                    quantity: 2,
                    unit_price: Decimal::new(200, 2),
                    addon_labels: vec![],
                    comment: None,
                },
            ],
            subtotal: Decimal::new(1550, 2),
            delivery_charge: Decimal::ZERO,
            total: Decimal::new(1550, 2),
            payment_method_label: "Cash on delivery".to_string(),
            is_paid: false,
            placed_at_label: "16.10.2026 19:42".to_string(),
            support_phone: "+7 800 555-35-35".to_string(),
        }
    }

    /// Printable lines of a rendered ticket (commands stripped)
    fn text_lines(data: &[u8]) -> Vec<String> {
        let mut text = Vec::new();
        let mut i = 0;
        while i < data.len() {
            match data[i] {
                0x1B | 0x1D => {
                    // ESC @ has no argument, all other commands used here take one
                    i += if data.get(i + 1) == Some(&0x40) { 2 } else { 3 };
                }
                b => {
                    text.push(b);
                    i += 1;
                }
            }
        }
        String::from_utf8_lossy(&text)
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_render_order_ticket() {
        let data = encode_ticket(&create_test_order(), 48);

        let number = find(&data, b"#1042").expect("order number");
        let first = find(&data, b"1x Pepperoni").expect("first item");
        let second = find(&data, b"2x Cola").expect("second item");
        assert!(number < first);
        assert!(first < second);

        // Starts with init, ends with the cut command
        assert_eq!(&data[..2], &[0x1B, 0x40]);
        assert!(data.ends_with(&[0x1D, 0x56, 0x00]));
    }

    #[test]
    fn test_totals_and_banner() {
        let lines = text_lines(&encode_ticket(&create_test_order(), 48));

        assert!(lines.iter().any(|l| l.starts_with("TOTAL") && l.ends_with("15.50")));
        assert!(lines.iter().any(|l| l == "NOT PAID"));
        assert!(lines.iter().any(|l| l == "Cash on delivery"));
        assert!(lines.iter().any(|l| l.starts_with("2x Cola") && l.ends_with("4.00")));
    }

    #[test]
    fn test_paid_banner() {
        let mut order = create_test_order();
        order.is_paid = true;
        let lines = text_lines(&encode_ticket(&order, 48));

        assert!(lines.iter().any(|l| l == "PAID"));
        assert!(!lines.iter().any(|l| l == "NOT PAID"));
    }

    #[test]
    fn test_cyrillic_bytes_preserved() {
        let data = encode_ticket(&create_test_order(), 48);
        assert!(find(&data, "Двойной соус".as_bytes()).is_some());
        assert!(find(&data, "ул. Ленина".as_bytes()).is_some());
    }

    #[test]
    fn test_addon_lines_wrapped_within_width() {
        for width in [20, 32, 48] {
            let lines = text_lines(&encode_ticket(&create_test_order(), width));
            let addon_lines: Vec<_> = lines
                .iter()
                .filter(|l| l.starts_with(ADDON_PREFIX) || l.starts_with(CONTINUATION))
                .collect();

            assert!(addon_lines.len() >= 3, "addons should wrap at width {}", width);
            for line in addon_lines {
                assert!(
                    line.chars().count() <= width,
                    "{:?} wider than {}",
                    line,
                    width
                );
            }
        }
    }

    #[test]
    fn test_item_total_overflow_prints_without_total() {
        let mut order = create_test_order();
        order.line_items[1].unit_price = Decimal::MAX;

        let bytes = TicketEncoder::new(48).encode(&order);
        assert!(find(&bytes, b"2x Cola\n").is_some());
    }

    #[test]
    fn test_comment_line() {
        let lines = text_lines(&encode_ticket(&create_test_order(), 48));
        assert!(lines.iter().any(|l| l == "  * Cut into 8 slices please"));
    }

    #[test]
    fn test_store_identity_block() {
        let encoder = TicketEncoder::new(32).with_store(StoreIdentity {
            name: "Pizza Napoli".to_string(),
            address: Some("Tverskaya 1".to_string()),
            extra_lines: vec!["INN 7701234567".to_string()],
        });
        let lines = text_lines(&encoder.encode(&create_test_order()));

        let header = lines.iter().position(|l| l == "DELIVERY").unwrap();
        let store = lines.iter().position(|l| l == "Pizza Napoli").unwrap();
        assert!(header < store);
        assert!(lines.iter().any(|l| l == "INN 7701234567"));
    }

    #[test]
    fn test_partial_cut() {
        let data = TicketEncoder::new(48)
            .with_cut(CutMode::Partial)
            .encode(&create_test_order());
        assert!(data.ends_with(&[0x1D, 0x56, 0x01]));
    }

    #[test]
    fn test_deterministic() {
        let order = create_test_order();
        assert_eq!(encode_ticket(&order, 42), encode_ticket(&order, 42));
    }

    #[test]
    fn test_test_page() {
        let data = TicketEncoder::new(32).test_page();
        let lines = text_lines(&data);

        assert!(lines.iter().any(|l| l == "PRINTER TEST"));
        assert!(lines.iter().any(|l| l.len() == 32 && l.starts_with("1234567890")));
        assert!(data.ends_with(&[0x1D, 0x56, 0x00]));
    }

    #[test]
    #[should_panic]
    fn test_zero_width_panics() {
        encode_ticket(&create_test_order(), 0);
    }
}
