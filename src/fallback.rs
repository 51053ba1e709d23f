//! # Stage: Smart Fallback Generator
//!
//! ## Responsibility
//! Produce a deterministic, rule-based answer with a confidence score,
//! without calling the external model. The router serves it outright when
//! confidence clears the accept threshold and otherwise keeps it as the
//! answer of last resort.
//!
//! ## Scoring
//!
//! | Pattern                                   | Confidence                          |
//! |-------------------------------------------|-------------------------------------|
//! | known service + credential keyword        | 0.95 (fixed, hand-written guide)    |
//! | credential keyword, no known service      | `min(0.5 + 0.3 + context, 0.9)`     |
//! | anything else                             | `min(0.5 + context, 0.7)`           |
//!
//! `context` is 0.2 when an earlier turn mentions a node, workflow, or
//! template, else 0.
//!
//! ## Guarantees
//! - Deterministic: same inputs, same answer and confidence.
//! - Bounded: confidence is in `[0, 0.95]`; generic answers never exceed 0.7.
//! - Never empty: every branch returns non-empty text.
//!
//! ## NOT Responsible For
//! - Deciding whether to call the external model (that belongs to `router`)

use crate::classify::{self, Category};
use crate::{Turn, GENERAL_TEMPLATE_ID};

/// Confidence every answer starts from.
pub const BASE_CONFIDENCE: f64 = 0.5;
/// Added when the question mentions credentials.
pub const CREDENTIAL_BONUS: f64 = 0.3;
/// Added when earlier turns already reference the template.
pub const CONTEXT_BONUS: f64 = 0.2;
/// Fixed confidence of whitelisted service guides.
pub const WHITELIST_CONFIDENCE: f64 = 0.95;
/// Ceiling for credential answers without a known service.
pub const CREDENTIAL_CAP: f64 = 0.9;
/// Ceiling for generic answers.
pub const GENERIC_CAP: f64 = 0.7;

/// Hand-written setup guide for one external service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceGuide {
    /// Display name.
    pub service: &'static str,
    /// Lowercase keywords, matched at word starts.
    pub keywords: &'static [&'static str],
    /// Step-by-step credential instructions.
    pub credential_steps: &'static str,
}

/// Services with a whitelisted credential guide.
pub const SERVICE_GUIDES: &[ServiceGuide] = &[
    ServiceGuide {
        service: "OpenAI",
        keywords: &["openai", "open ai", "chatgpt"],
        credential_steps: "\
1. Go to https://platform.openai.com/api-keys and sign in.
2. Click **Create new secret key**, give it a name, and copy the key (it is shown only once).
3. Make sure your account has billing enabled at https://platform.openai.com/account/billing, otherwise requests fail with a quota error.
4. In your workflow, open the OpenAI node, choose **Credential to connect with → Create new credential**.
5. Paste the key into **API Key** and save. The node should show a green check.
6. Run the node once with **Test step** to confirm the connection.",
    },
    ServiceGuide {
        service: "Slack",
        keywords: &["slack"],
        credential_steps: "\
1. Go to https://api.slack.com/apps and click **Create New App → From scratch**.
2. Under **OAuth & Permissions**, add the bot scopes the template needs (usually `chat:write`, `channels:read`).
3. Click **Install to Workspace** and approve.
4. Copy the **Bot User OAuth Token** (starts with `xoxb-`).
5. In your workflow, open the Slack node, create a new credential, and paste the token.
6. Invite the bot to the target channel with `/invite @your-app`, then run **Test step**.",
    },
    ServiceGuide {
        service: "Google",
        keywords: &["google", "gmail", "google sheets", "sheets", "google drive"],
        credential_steps: "\
1. Open https://console.cloud.google.com and create (or select) a project.
2. Enable the API the template uses (Gmail, Sheets, or Drive) under **APIs & Services → Library**.
3. Configure the **OAuth consent screen** and add yourself as a test user.
4. Create an **OAuth client ID** of type *Web application* and add the redirect URL shown in the credential dialog of your workflow tool.
5. Paste the client ID and secret into a new Google credential in the node, then click **Sign in with Google**.
6. Run **Test step** on the node to confirm access.",
    },
    ServiceGuide {
        service: "Notion",
        keywords: &["notion"],
        credential_steps: "\
1. Go to https://www.notion.so/my-integrations and click **New integration**.
2. Pick the workspace, give it a name, and copy the **Internal Integration Secret**.
3. Open each Notion page or database the template uses, click **… → Connections**, and add your integration.
4. In your workflow, create a Notion credential in the node and paste the secret.
5. Run **Test step** to confirm the node can read the database.",
    },
    ServiceGuide {
        service: "Airtable",
        keywords: &["airtable"],
        credential_steps: "\
1. Go to https://airtable.com/create/tokens and click **Create new token**.
2. Add the scopes `data.records:read` and `data.records:write`, and grant access to the base the template uses.
3. Copy the token.
4. In your workflow, create an Airtable credential in the node and paste the token.
5. Run **Test step** to confirm the base and table are visible.",
    },
];

/// Which rule produced a fallback answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// A whitelisted service credential guide.
    ServiceCredential(&'static str),
    /// Generic credential instructions.
    Credential,
    /// A known service mentioned without credentials.
    ServiceMention(&'static str),
    /// Everything else.
    Generic,
}

/// A rule-based answer.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackAnswer {
    /// Answer text; never empty.
    pub answer: String,
    /// Confidence in `[0, 0.95]`.
    pub confidence: f64,
    /// Rule that fired.
    pub kind: FallbackKind,
    /// Topic of the question.
    pub category: Category,
}

/// Find the service guide whose keywords appear in `text`.
pub fn detect_service(text: &str) -> Option<&'static ServiceGuide> {
    let lower = text.to_lowercase();
    SERVICE_GUIDES.iter().find(|g| {
        g.keywords
            .iter()
            .any(|k| classify::contains_keyword(&lower, k))
    })
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Deterministic rule-based responder.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmartFallbackGenerator;

impl SmartFallbackGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self
    }

    /// Produce an answer for `question` about `template_id` given the prior
    /// conversation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use learned_response_router::SmartFallbackGenerator;
    /// let answer = SmartFallbackGenerator::new().generate("How do I add OpenAI credentials?", "T1", &[]);
    /// assert!(answer.confidence >= 0.9);
    /// assert!(answer.answer.contains("platform.openai.com"));
    /// ```
    pub fn generate(&self, question: &str, template_id: &str, history: &[Turn]) -> FallbackAnswer {
        let category = classify::classify_category(question);
        let credential = classify::is_credential_related(question);
        let service = detect_service(question);
        let context_bonus = if history
            .iter()
            .any(|t| classify::references_template_context(&t.content))
        {
            CONTEXT_BONUS
        } else {
            0.0
        };

        if let (Some(guide), true) = (service, credential) {
            return FallbackAnswer {
                answer: format!(
                    "Here is how to connect {} to your {}:\n\n{}",
                    guide.service,
                    template_label(template_id),
                    guide.credential_steps
                ),
                confidence: WHITELIST_CONFIDENCE,
                kind: FallbackKind::ServiceCredential(guide.service),
                category,
            };
        }

        if credential {
            return FallbackAnswer {
                answer: credential_answer(template_id),
                confidence: round2(
                    (BASE_CONFIDENCE + CREDENTIAL_BONUS + context_bonus).min(CREDENTIAL_CAP),
                ),
                kind: FallbackKind::Credential,
                category,
            };
        }

        let confidence = round2((BASE_CONFIDENCE + context_bonus).min(GENERIC_CAP));
        match service {
            Some(guide) => FallbackAnswer {
                answer: service_mention_answer(guide, template_id),
                confidence,
                kind: FallbackKind::ServiceMention(guide.service),
                category,
            },
            None => FallbackAnswer {
                answer: generic_answer(category, template_id),
                confidence,
                kind: FallbackKind::Generic,
                category,
            },
        }
    }
}

fn template_label(template_id: &str) -> String {
    if template_id == GENERAL_TEMPLATE_ID {
        "workflow".to_string()
    } else {
        format!("template \"{template_id}\"")
    }
}

fn credential_answer(template_id: &str) -> String {
    format!(
        "To add credentials for your {}:\n\n\
1. Open the node that shows a warning triangle.\n\
2. In **Credential to connect with**, choose **Create new credential**.\n\
3. Follow the link in the dialog to the service's developer console and create an API key or OAuth app.\n\
4. Paste the key (or client ID and secret) into the dialog and save.\n\
5. Run **Test step** on the node to confirm the connection.\n\n\
Tell me which service the node connects to and I can give you exact steps.",
        template_label(template_id)
    )
}

fn service_mention_answer(guide: &ServiceGuide, template_id: &str) -> String {
    format!(
        "Your {} uses {}. The usual setup order is:\n\n\
1. Connect a {} credential on every {} node.\n\
2. Fill in the node parameters (IDs, channels, or fields) with your own values.\n\
3. Run **Test step** on the first {} node, then execute the whole workflow.\n\n\
Ask me about the {} credential if you haven't created one yet.",
        template_label(template_id),
        guide.service,
        guide.service,
        guide.service,
        guide.service,
        guide.service
    )
}

fn generic_answer(category: Category, template_id: &str) -> String {
    let label = template_label(template_id);
    match category {
        Category::Troubleshooting => format!(
            "Let's debug your {label}:\n\n\
1. Open the execution log and find the first node marked red.\n\
2. Read the error message on that node; most failures are missing credentials or an empty required field.\n\
3. Check the input data the node received in the **Input** panel.\n\
4. Fix the value and re-run with **Test step** on that node.\n\n\
If you paste the error message here I can be more specific."
        ),
        Category::Testing => format!(
            "To test your {label}:\n\n\
1. Make sure every node has its credentials connected.\n\
2. Click **Execute workflow** to run it once manually.\n\
3. Watch each node turn green; click any node to inspect its output.\n\
4. When the run succeeds, activate the workflow so it runs on its trigger."
        ),
        Category::Configuration => format!(
            "To configure your {label}:\n\n\
1. Open each node and look for placeholder values (IDs, emails, channel names).\n\
2. Replace them with your own values; expressions in `{{{{ }}}}` pull data from earlier nodes.\n\
3. Save, then run **Test step** on the node you changed."
        ),
        Category::Credentials | Category::General => format!(
            "I can help you get your {label} running. The usual steps are:\n\n\
1. Connect credentials on every node that needs them.\n\
2. Adjust node settings to your own accounts and data.\n\
3. Test the workflow once manually.\n\
4. Activate it.\n\n\
Which step are you on?"
        ),
    }
}
