use std::collections::BTreeMap;

use minijinja::Environment;
use serde::Serialize;

use crate::ai::receipt::{BRAND_RULES, ITEM_CATEGORIES, RECEIPT_CATEGORIES};
use crate::ai::PromptKind;
use crate::error::{Error, ErrorDetails};

/// A rendered prompt, ready to be sent to the generation provider
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub text: String,
}

#[derive(Debug)]
pub struct PromptTemplates {
    env: Environment<'static>,
}

#[derive(Serialize)]
struct BrandRule {
    keywords: &'static [&'static str],
    category: &'static str,
}

impl PromptTemplates {
    pub fn new() -> Result<Self, Error> {
        let mut env = Environment::new();
        for (kind, source) in [
            (
                PromptKind::ReceiptExtraction,
                include_str!("templates/receipt_extraction.minijinja"),
            ),
            (
                PromptKind::FinancialAdvice,
                include_str!("templates/financial_advice.minijinja"),
            ),
            (PromptKind::Chat, include_str!("templates/chat.minijinja")),
        ] {
            let name: &'static str = kind.into();
            env.add_template(name, source).map_err(|e| {
                Error::new(ErrorDetails::TemplateRender {
                    template_name: name.to_string(),
                    message: e.to_string(),
                })
            })?;
        }
        Ok(Self { env })
    }

    fn render(&self, kind: PromptKind, context: impl Serialize) -> Result<Prompt, Error> {
        let name: &'static str = kind.into();
        let template = self.env.get_template(name).map_err(|e| {
            Error::new(ErrorDetails::TemplateRender {
                template_name: name.to_string(),
                message: e.to_string(),
            })
        })?;
        let text = template.render(context).map_err(|e| {
            Error::new(ErrorDetails::TemplateRender {
                template_name: name.to_string(),
                message: e.to_string(),
            })
        })?;
        Ok(Prompt { kind, text })
    }

    pub fn receipt_extraction(&self, raw_text: &str) -> Result<Prompt, Error> {
        let brand_rules: Vec<BrandRule> = BRAND_RULES
            .iter()
            .map(|(keywords, category)| BrandRule {
                keywords,
                category,
            })
            .collect();
        self.render(
            PromptKind::ReceiptExtraction,
            minijinja::context! {
                raw_text,
                receipt_categories => RECEIPT_CATEGORIES,
                item_categories => ITEM_CATEGORIES,
                brand_rules,
            },
        )
    }

    pub fn financial_advice(
        &self,
        total_spent: &str,
        categories: &BTreeMap<String, String>,
        currency: &str,
    ) -> Result<Prompt, Error> {
        self.render(
            PromptKind::FinancialAdvice,
            minijinja::context! { total_spent, categories, currency },
        )
    }

    pub fn chat(&self, message: &str) -> Result<Prompt, Error> {
        self.render(PromptKind::Chat, minijinja::context! { message })
    }
}
