//! Webhook providers and their payload formats

use std::fmt;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::schema::{
    DiscordConfig, DiscordTemplate, GenericConfig, NotificationField, SlackConfig, SlackTemplate,
    TeamsConfig, TeamsSection, TeamsTemplate, WebhooksConfig,
};
use crate::notify::events::{EventKind, NotificationEvent};

const FOOTER: &str = "GitHub Runner Manager";

/// A configured webhook destination
#[derive(Debug, Clone)]
pub enum WebhookProvider {
    Slack(SlackConfig),
    Discord(DiscordConfig),
    Teams(TeamsConfig),
    Generic(GenericConfig),
}

impl WebhookProvider {
    pub fn name(&self) -> &'static str {
        match self {
            WebhookProvider::Slack(_) => "slack",
            WebhookProvider::Discord(_) => "discord",
            WebhookProvider::Teams(_) => "teams",
            WebhookProvider::Generic(_) => "generic",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            WebhookProvider::Slack(c) => c.enabled,
            WebhookProvider::Discord(c) => c.enabled,
            WebhookProvider::Teams(c) => c.enabled,
            WebhookProvider::Generic(c) => c.enabled,
        }
    }

    pub fn webhook_url(&self) -> &str {
        match self {
            WebhookProvider::Slack(c) => &c.webhook_url,
            WebhookProvider::Discord(c) => &c.webhook_url,
            WebhookProvider::Teams(c) => &c.webhook_url,
            WebhookProvider::Generic(c) => &c.webhook_url,
        }
    }

    /// Per-provider timeout override in seconds
    pub fn timeout(&self) -> Option<u64> {
        match self {
            WebhookProvider::Slack(c) => c.timeout,
            WebhookProvider::Discord(c) => c.timeout,
            WebhookProvider::Teams(c) => c.timeout,
            WebhookProvider::Generic(c) => c.timeout,
        }
    }

    fn events(&self) -> &[EventKind] {
        match self {
            WebhookProvider::Slack(c) => &c.events,
            WebhookProvider::Discord(c) => &c.events,
            WebhookProvider::Teams(c) => &c.events,
            WebhookProvider::Generic(c) => &c.events,
        }
    }

    pub fn subscribes(&self, kind: EventKind) -> bool {
        self.events().contains(&kind)
    }

    /// Extra request headers
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            WebhookProvider::Generic(c) => c
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Body posted for `event`
    pub fn format(&self, event: &NotificationEvent) -> Value {
        match self {
            WebhookProvider::Slack(c) => format_slack(c, event),
            WebhookProvider::Discord(c) => format_discord(c, event),
            WebhookProvider::Teams(c) => format_teams(c, event),
            WebhookProvider::Generic(_) => json!({
                "event": event.kind.as_str(),
                "timestamp": event.timestamp.to_rfc3339(),
                "payload": event.payload,
            }),
        }
    }
}

impl fmt::Display for WebhookProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every configured provider, enabled or not, in a fixed order
pub fn providers_from_config(config: &WebhooksConfig) -> Vec<WebhookProvider> {
    let mut providers = Vec::new();
    if let Some(c) = &config.slack {
        providers.push(WebhookProvider::Slack(c.clone()));
    }
    if let Some(c) = &config.discord {
        providers.push(WebhookProvider::Discord(c.clone()));
    }
    if let Some(c) = &config.teams {
        providers.push(WebhookProvider::Teams(c.clone()));
    }
    if let Some(c) = &config.generic {
        providers.push(WebhookProvider::Generic(c.clone()));
    }
    providers
}

/// Template for `kind`, then `default`
fn pick<'a, T>(templates: &'a std::collections::BTreeMap<String, T>, kind: EventKind) -> Option<&'a T> {
    templates.get(kind.as_str()).or_else(|| templates.get("default"))
}

fn format_slack(config: &SlackConfig, event: &NotificationEvent) -> Value {
    let fallback;
    let template = match pick(&config.templates, event.kind) {
        Some(t) => t,
        None => {
            fallback = SlackTemplate {
                title: event.kind.title(),
                text: format!("Event {}", event.kind),
                color: "#36a64f".to_string(),
                use_attachment: true,
                fields: Vec::new(),
            };
            &fallback
        }
    };

    let text = format_template(&template.text, &event.payload);
    let attachment = json!({
        "color": template.color,
        "title": format_template(&template.title, &event.payload),
        "text": text,
        "fields": template.fields.iter().map(|field| json!({
            "title": format_template(&field.name, &event.payload),
            "value": format_template(&field.value, &event.payload),
            "short": field.short,
        })).collect::<Vec<_>>(),
        "footer": format!("{} • {}", FOOTER, event.timestamp.format("%Y-%m-%d %H:%M:%S")),
        "mrkdwn_in": ["text", "fields"],
    });

    let mut payload = json!({
        "username": config.username,
        "text": if template.use_attachment { String::new() } else { text },
        "attachments": if template.use_attachment { vec![attachment] } else { Vec::new() },
    });
    if !config.channel.is_empty() {
        payload["channel"] = Value::String(config.channel.clone());
    }
    payload
}

fn format_discord(config: &DiscordConfig, event: &NotificationEvent) -> Value {
    let fallback;
    let template = match pick(&config.templates, event.kind) {
        Some(t) => t,
        None => {
            fallback = DiscordTemplate {
                title: event.kind.title(),
                description: format!("Event {}", event.kind),
                color: if event.kind.is_failure() { 15158332 } else { 3066993 },
                fields: Vec::new(),
            };
            &fallback
        }
    };

    json!({
        "username": config.username,
        "avatar_url": config.avatar_url.clone().unwrap_or_default(),
        "embeds": [{
            "title": format_template(&template.title, &event.payload),
            "description": format_template(&template.description, &event.payload),
            "color": template.color,
            "fields": render_fields(&template.fields, &event.payload),
            "timestamp": event.timestamp.to_rfc3339(),
        }],
    })
}

fn render_fields(fields: &[NotificationField], payload: &Map<String, Value>) -> Vec<Value> {
    fields
        .iter()
        .map(|field| {
            json!({
                "name": format_template(&field.name, payload),
                "value": format_template(&field.value, payload),
                "inline": field.inline,
            })
        })
        .collect()
}

fn format_teams(config: &TeamsConfig, event: &NotificationEvent) -> Value {
    let fallback;
    let template = match pick(&config.templates, event.kind) {
        Some(t) => t,
        None => {
            fallback = TeamsTemplate {
                title: event.kind.title(),
                theme_color: "0076D7".to_string(),
                sections: vec![TeamsSection {
                    activity_title: format!("Event {}", event.kind),
                    facts: Vec::new(),
                }],
            };
            &fallback
        }
    };

    let title = format_template(&template.title, &event.payload);
    let sections: Vec<Value> = template
        .sections
        .iter()
        .map(|section| {
            json!({
                "activityTitle": format_template(&section.activity_title, &event.payload),
                "facts": section.facts.iter().map(|fact| json!({
                    "name": format_template(&fact.name, &event.payload),
                    "value": format_template(&fact.value, &event.payload),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "summary": title,
        "themeColor": template.theme_color,
        "title": title,
        "sections": sections,
    })
}

/// Substitute `{field}` placeholders from `payload`.
///
/// `{{` and `}}` are literal braces. Any unresolved or malformed placeholder
/// leaves the whole template untouched.
pub fn format_template(template: &str, payload: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                match payload.get(key.trim()) {
                    Some(value) if closed => out.push_str(&render_value(value)),
                    _ => {
                        warn!("Unresolved template variable {{{}}}", key);
                        return template.to_string();
                    }
                }
            }
            '}' => return template.to_string(),
            other => out.push(other),
        }
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}
