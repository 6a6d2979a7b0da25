//! Sign-in devices, used to decide when to send a login notification.
//!
//! The registry remembers, per user, the last session seen from each
//! user agent and IP address pair. A new session from a pair that already
//! has a different session is a known device. Contact details of users who
//! made authenticated requests are kept so the notification can be
//! addressed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::AuthUser;

/// Where to send a user's notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub name: String,
}

/// A newly created session as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub user_agent: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeviceKey {
    user_id: String,
    user_agent: String,
    ip_address: String,
}

#[derive(Debug, Default)]
struct Registry {
    contacts: HashMap<String, Contact>,
    /// Last session id seen per device.
    devices: HashMap<DeviceKey, String>,
}

/// In-memory registry of users and their sign-in devices. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or refreshes the contact details of an authenticated user.
    pub async fn remember_user(&self, user: &AuthUser) {
        if user.email.trim().is_empty() {
            return;
        }
        let contact = Contact {
            email: user.email.clone(),
            name: user.name.clone(),
        };

        let mut registry = self.inner.write().await;
        if registry.contacts.get(&user.id) != Some(&contact) {
            registry.contacts.insert(user.id.clone(), contact);
        }
    }

    pub async fn contact(&self, user_id: &str) -> Option<Contact> {
        self.inner.read().await.contacts.get(user_id).cloned()
    }

    /// Records a new session. Returns `true` when another session already
    /// came from the same user agent and address.
    pub async fn record_session(&self, session: &SessionInfo) -> bool {
        let key = DeviceKey {
            user_id: session.user_id.clone(),
            user_agent: session.user_agent.clone(),
            ip_address: session.ip_address.clone(),
        };

        let mut registry = self.inner.write().await;
        let previous = registry.devices.insert(key, session.session_id.clone());
        previous.is_some_and(|id| id != session.session_id)
    }
}

/// Short, human readable description of a user agent, such as
/// `Firefox on Linux`.
pub fn describe_device(user_agent: &str) -> String {
    let ua = user_agent.trim();
    if ua.is_empty() {
        return "Unknown device".to_string();
    }

    let lower = ua.to_ascii_lowercase();
    if ["bot", "spider", "crawler"].iter().any(|m| lower.contains(m)) {
        return "Automated access (bot)".to_string();
    }

    let tools = [
        ("curl", "Command line (curl)"),
        ("wget", "Command line (wget)"),
        ("httpie", "Command line (HTTPie)"),
        ("postman", "API client (Postman)"),
        ("insomnia", "API client (Insomnia)"),
    ];
    if let Some((_, label)) = tools.iter().find(|(marker, _)| lower.contains(marker)) {
        return (*label).to_string();
    }

    // Order matters: Edge and Opera also claim Chrome, Chrome claims Safari.
    let browser = if ua.contains("Edg/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Firefox/") {
        "Firefox"
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        "Chrome"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "Browser"
    };

    // iPads report "Mac OS X" and Android reports "Linux".
    let os = if ua.contains("iPhone") || ua.contains("iPad") {
        "iOS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("CrOS") {
        "ChromeOS"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macOS"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "System"
    };

    format!("{browser} on {os}")
}
