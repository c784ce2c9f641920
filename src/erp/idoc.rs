//! IDoc-style XML rendering for the sales order (`ORDERS05`) and customer
//! master (`DEBMAS07`) documents.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use crate::domain::aggregates::Customer;
use crate::domain::events::OrderEvent;

pub const POSITION_BASE: u32 = 10;
pub const POSITION_STRIDE: u32 = 10;
pub const POSITION_WIDTH: usize = 6;

const SALES_ORG: &str = "1710";
const DISTRIBUTION_CHANNEL: &str = "10";
const DIVISION: &str = "00";
const COMPANY_CODE: &str = "1710";
const RECONCILIATION_ACCOUNT: &str = "140000";
const ACCOUNT_ASSIGNMENT_GROUP: &str = "01";
const DEFAULT_SALUTATION: &str = "Firma";
const SORT_KEY_LEN: usize = 10;

/// Zero-padded item position: 000010, 000020, ...
pub fn position(index: usize) -> String {
    let value = POSITION_BASE as usize + index * POSITION_STRIDE as usize;
    format!("{value:0width$}", width = POSITION_WIDTH)
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

pub fn sap_date(at: DateTime<Utc>) -> String { at.format("%Y%m%d").to_string() }

/// Upper-cased first ten characters of the last name.
pub fn sort_key(last_name: &str) -> String {
    last_name.chars().take(SORT_KEY_LEN).collect::<String>().to_uppercase()
}

/// Accumulates indented XML; values are escaped, tags are trusted constants.
struct Xml {
    out: String,
    depth: usize,
}

impl Xml {
    fn new() -> Self { Self { out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"), depth: 0 } }

    fn open(&mut self, tag: &str, attrs: &str) -> &mut Self {
        let _ = writeln!(self.out, "{:indent$}<{tag}{attrs}>", "", indent = self.depth * 4);
        self.depth += 1;
        self
    }

    fn segment(&mut self, tag: &str) -> &mut Self { self.open(tag, " SEGMENT=\"1\"") }

    fn field(&mut self, tag: &str, value: &str) -> &mut Self {
        let _ = writeln!(self.out, "{:indent$}<{tag}>{}</{tag}>", "", escape(value), indent = self.depth * 4);
        self
    }

    fn close(&mut self, tag: &str) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        let _ = writeln!(self.out, "{:indent$}</{tag}>", "", indent = self.depth * 4);
        self
    }

    fn finish(self) -> String { self.out }
}

fn control_record(xml: &mut Xml, idoc_type: &str, message_type: &str, created: &str) {
    xml.segment("EDI_DC40")
        .field("TABNAM", "EDI_DC40")
        .field("DIRECT", "2")
        .field("IDOCTYP", idoc_type)
        .field("MESTYP", message_type)
        .field("SNDPRT", "LS")
        .field("RCVPRT", "LS")
        .field("CREDAT", created)
        .close("EDI_DC40");
}

fn address_fields(xml: &mut Xml, customer: &Customer, default_country: &str) {
    let country = customer.country.as_deref().unwrap_or(default_country).to_uppercase();
    xml.field("NAME1", &customer.full_name())
        .field("STRAS", &customer.street_line())
        .field("ORT01", customer.city.as_deref().unwrap_or_default())
        .field("PSTLZ", &customer.postal_code)
        .field("LAND1", &country);
}

pub fn render_orders05(event: &OrderEvent, default_country: &str, created: DateTime<Utc>) -> String {
    let date = sap_date(created);
    let mut xml = Xml::new();
    xml.open("ORDERS05", "").open("IDOC", " BEGIN=\"1\"");
    control_record(&mut xml, "ORDERS05", "ORDERS", &date);

    xml.segment("E1EDK01")
        .field("CURCY", &event.currency)
        .field("BELNR", event.order_id.as_str())
        .field("BSART", "OR")
        .close("E1EDK01");
    for (qualifier, org) in [("008", SALES_ORG), ("007", DISTRIBUTION_CHANNEL), ("006", DIVISION)] {
        xml.segment("E1EDK14").field("QUALF", qualifier).field("ORGID", org).close("E1EDK14");
    }

    xml.segment("E1EDKA1").field("PARVW", "AG").field("PARTN", &event.customer.email);
    address_fields(&mut xml, &event.customer, default_country);
    xml.close("E1EDKA1");

    for (index, item) in event.items.iter().enumerate() {
        xml.segment("E1EDP01")
            .field("POSEX", &position(index))
            .field("MATNR", item.product_code.as_str())
            .field("ARKTX", &item.name)
            .field("MENGE", &item.quantity.to_string())
            .field("VRKME", "ST")
            .field("NETPR", &item.unit_price.to_string())
            .field("WAER2", &event.currency)
            .close("E1EDP01");
    }

    xml.close("IDOC").close("ORDERS05");
    xml.finish()
}

pub fn render_debmas07(event: &OrderEvent, default_country: &str, created: DateTime<Utc>) -> String {
    let customer = &event.customer;
    let mut xml = Xml::new();
    xml.open("DEBMAS07", "").open("IDOC", " BEGIN=\"1\"");
    control_record(&mut xml, "DEBMAS07", "DEBMAS", &sap_date(created));

    xml.segment("E1KNA1M").field("ANRED", DEFAULT_SALUTATION);
    address_fields(&mut xml, customer, default_country);
    xml.field("SORTL", &sort_key(&customer.last_name))
        .field("SPRAS", "N")
        .field("STCEG", customer.vat_number.as_deref().unwrap_or_default())
        .close("E1KNA1M");

    xml.segment("E1KNB1M").field("BUKRS", COMPANY_CODE).field("AKONT", RECONCILIATION_ACCOUNT).close("E1KNB1M");
    xml.segment("E1KNVVM")
        .field("VKORG", SALES_ORG)
        .field("VTWEG", DISTRIBUTION_CHANNEL)
        .field("SPART", DIVISION)
        .field("WAERS", &event.currency)
        .field("KTGRD", ACCOUNT_ASSIGNMENT_GROUP)
        .close("E1KNVVM");

    xml.close("IDOC").close("DEBMAS07");
    xml.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_are_padded_and_strided() {
        assert_eq!(position(0), "000010");
        assert_eq!(position(1), "000020");
        assert_eq!(position(99), "001000");
    }

    #[test]
    fn test_escape_and_sort_key() {
        assert_eq!(escape("Smith & <Sons> \"Ltd\""), "Smith &amp; &lt;Sons&gt; &quot;Ltd&quot;");
        assert_eq!(escape("a\u{0}b"), "ab");
        assert_eq!(sort_key("Vandenbroucke-Ol"), "VANDENBROU");
        assert_eq!(sort_key("Li"), "LI");
    }

    #[test]
    fn test_xml_nesting() {
        let mut xml = Xml::new();
        xml.open("A", "").segment("B").field("C", "x<y").close("B").close("A");
        let out = xml.finish();
        assert!(out.contains("\n    <B SEGMENT=\"1\">\n        <C>x&lt;y</C>\n    </B>\n</A>\n"));
    }
}
