//! Structured receipt extraction result and the parser for the model's reply.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorDetails};

pub const RECEIPT_CATEGORIES: &[&str] = &[
    "Market",
    "Yeme-İçme",
    "Akaryakıt",
    "Giyim",
    "Teknoloji",
    "Sağlık",
    "Diğer",
];

pub const ITEM_CATEGORIES: &[&str] = &[
    "Gıda",
    "Et & Tavuk",
    "İçecek",
    "Baharat & Çeşni",
    "Meyve & Sebze",
    "Atıştırmalık",
    "Temizlik & Bakım",
    "Sigara",
    "Alkol",
    "Akaryakıt",
    "Kişisel Bakım",
    "Ev Eşyası",
    "Giyim",
    "Elektronik",
    "Hizmet",
    "Diğer",
];

/// Keyword hints given to the model for item categorization
pub const BRAND_RULES: &[(&[&str], &str)] = &[
    (
        &["Banvit", "Piliç", "Tavuk", "Et", "Sucuk", "Salam", "Sosis"],
        "Et & Tavuk",
    ),
    (
        &[
            "Kahve Dünyası",
            "Red Bull",
            "Coca Cola",
            "Pepsi",
            "Fanta",
            "Sprite",
            "Su",
            "Çay",
            "Kahve",
            "Ayran",
            "Meyve Suyu",
        ],
        "İçecek",
    ),
    (
        &[
            "Sumak", "Baharat", "Kimyon", "Karabiber", "Tuz", "Şeker", "Sos", "Ketçap", "Mayonez",
        ],
        "Baharat & Çeşni",
    ),
    (
        &["Cips", "Çikolata", "Bisküvi", "Gofret", "Kuruyemiş"],
        "Atıştırmalık",
    ),
    (
        &["Domates", "Salatalık", "Elma", "Muz", "Portakal", "Meyve", "Sebze"],
        "Meyve & Sebze",
    ),
    (
        &[
            "Ekmek", "Süt", "Yumurta", "Peynir", "Yoğurt", "Tereyağ", "Zeytin", "Reçel", "Bal",
        ],
        "Gıda",
    ),
];

const DEFAULT_CATEGORY: &str = "Diğer";

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReceipt {
    pub merchant_name: String,
    #[serde(default)]
    pub date: String,
    #[serde(deserialize_with = "deserialize_amount")]
    pub total_amount: f64,
    #[serde(default, deserialize_with = "deserialize_amount")]
    pub tax_amount: f64,
    #[serde(default, deserialize_with = "deserialize_amount")]
    pub discount_amount: f64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
    /// Fields the model returned beyond the known shape
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_amount")]
    pub price: f64,
    #[serde(default = "default_category")]
    pub category: String,
}

/// Accepts JSON numbers, numeric strings (`"12,50"` included) and `null` (as 0)
fn deserialize_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom(format!("amount out of range: {n}"))),
        Value::String(s) => {
            let normalized = s.trim().replace(',', ".");
            normalized
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid amount: `{s}`")))
        }
        Value::Null => Ok(0.0),
        other => Err(de::Error::custom(format!("invalid amount: {other}"))),
    }
}

/// Keeps only the body of the first Markdown code fence, if any, then trims.
/// The fence's info string (`json`, `JSON`, ...) is dropped regardless of case.
pub fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(start) = text.find("```") else {
        return text;
    };
    let body = text[start + 3..].trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let body = body.find("```").map_or(body, |end| &body[..end]);
    body.trim()
}

pub fn parse_receipt(text: &str) -> Result<ParsedReceipt, Error> {
    let cleaned = strip_fences(text);
    let deserializer = &mut serde_json::Deserializer::from_str(cleaned);
    serde_path_to_error::deserialize(deserializer).map_err(|e| {
        Error::new(ErrorDetails::MalformedStructuredResponse {
            message: e.to_string(),
            raw_output: text.to_string(),
        })
    })
}
