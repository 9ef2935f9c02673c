//! Canned-reply rules for the visitor widget.
//!
//! Intentionally not NLP: an ordered table of keyword rules evaluated
//! top-to-bottom, first match wins. Single-word keywords must match a whole
//! word of the visitor text; multi-word keywords match as substrings.

pub const ESCALATION_OFFER: &str = "Connect to live agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Canned,
    Escalation,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct BotReply {
    pub kind: ReplyKind,
    pub text: &'static str,
    pub suggestions: &'static [&'static str],
}

struct CannedRule {
    kind: ReplyKind,
    keywords: &'static [&'static str],
    reply: &'static str,
    suggestions: &'static [&'static str],
}

const RULES: &[CannedRule] = &[
    CannedRule {
        kind: ReplyKind::Escalation,
        keywords: &[
            "agent",
            "human",
            "representative",
            "live agent",
            "real person",
            "speak to someone",
        ],
        reply: "I can connect you with a member of our team.",
        suggestions: &[ESCALATION_OFFER],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["hi", "hello", "hey", "good morning", "good afternoon"],
        reply: "Hello! Welcome to the firm. How can I help you today?",
        suggestions: &["Our services", "Document preparation", "Schedule a consultation"],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["services", "service", "practice areas", "what do you do"],
        reply: "We provide paralegal support for criminal, family, and civil matters, \
                including document preparation and court filings. Which area do you need?",
        suggestions: &["Document preparation", "Court filings", "Pricing"],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["document", "documents", "paperwork", "preparation", "drafting"],
        reply: "We prepare legal documents such as motions, petitions, and correspondence. \
                Tell me what you need drafted and we can get started.",
        suggestions: &["Pricing", "Timelines", ESCALATION_OFFER],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["pricing", "price", "cost", "fee", "fees", "rates", "how much"],
        reply: "Standard document preparation is billed at a flat fee; complex filings are \
                quoted individually. Share the filing type for an estimate.",
        suggestions: &["Document preparation", ESCALATION_OFFER],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["timeline", "timelines", "turnaround", "how long", "deadline"],
        reply: "Most document requests are completed within 3 to 5 business days. \
                Rush service is available for court deadlines.",
        suggestions: &["Court filings", "Schedule a consultation"],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["court", "filing", "filings", "efile", "e-file"],
        reply: "We handle filings in New York state and federal courts, including \
                electronic filing where the court supports it.",
        suggestions: &["Timelines", "Pricing"],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["contact", "phone", "email", "address", "location", "reach you"],
        reply: "You can reach the office at (212) 347-5020 or info@corley.legal, \
                99 Wall Street Suite 4837, New York, NY 10005.",
        suggestions: &["Schedule a consultation", ESCALATION_OFFER],
    },
    CannedRule {
        kind: ReplyKind::Canned,
        keywords: &["schedule", "appointment", "consultation", "meeting", "book"],
        reply: "Consultations are available Monday through Friday, 9am to 5pm. \
                Share your availability and we will confirm a time.",
        suggestions: &["Contact info", ESCALATION_OFFER],
    },
];

const FALLBACK_REPLY: &str =
    "I'm not sure about that. Would you like to speak with a live agent?";

pub fn match_reply(text: &str) -> BotReply {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    for rule in RULES {
        let hit = rule.keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                lower.contains(keyword)
            } else {
                words.iter().any(|w| w == keyword)
            }
        });
        if hit {
            return BotReply {
                kind: rule.kind,
                text: rule.reply,
                suggestions: rule.suggestions,
            };
        }
    }

    BotReply {
        kind: ReplyKind::Fallback,
        text: FALLBACK_REPLY,
        suggestions: &[ESCALATION_OFFER],
    }
}

pub fn has_escalation_intent(text: &str) -> bool {
    match_reply(text).kind == ReplyKind::Escalation
}
