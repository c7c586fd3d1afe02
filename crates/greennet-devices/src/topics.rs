/*!
 * Topic grammar of one gateway.
 *
 * Every topic lives under `<base>/<gatewayId>`. [`Topics`] builds the
 * outbound topics and subscription patterns and classifies inbound topics
 * into a [`Route`].
 */
use greennet_core::utils::join_topic;

/// Inbound topic classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `stream/devices/<id>[/<path>]`, bulk snapshot
    Snapshot {
        /// Device id segment
        device_id: String,
        /// Property path, empty for a whole object
        path: String,
    },
    /// `stream/device/<id>[/<path>]`, live delta
    Delta {
        /// Device id segment
        device_id: String,
        /// Property path, empty for a whole object
        path: String,
    },
    /// `stream/telegram/<id>/from[/<path>]`, raw radio traffic
    Telegram {
        /// Device id segment
        device_id: String,
        /// Property path, empty for a whole object
        path: String,
    },
    /// `getAnswer/devices[/<id>]`, answer to a device list query
    DevicesAnswer {
        /// Device id segment when the answer is for one device
        device_id: Option<String>,
    },
    /// `getAnswer/systemInfo`
    SystemInfo,
    /// `getAnswer/uptime`
    Uptime,
}

/// Topic builder for one gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    /// Create the topic set for `<base>/<gateway_id>`
    pub fn new(base: &str, gateway_id: &str) -> Self {
        Self {
            root: join_topic([base.trim_matches('/'), gateway_id.trim_matches('/')]),
        }
    }

    /// The `<base>/<gatewayId>` prefix
    pub fn root(&self) -> &str {
        &self.root
    }

    fn under(&self, parts: &[&str]) -> String {
        join_topic(std::iter::once(self.root.as_str()).chain(parts.iter().copied()))
    }

    /// Pattern for the bulk snapshot stream
    pub fn snapshot_pattern(&self) -> String {
        self.under(&["stream", "devices", "#"])
    }

    /// Pattern for the live delta stream
    pub fn delta_pattern(&self) -> String {
        self.under(&["stream", "device", "#"])
    }

    /// Pattern for inbound telegrams. Outbound (`to`) traffic is not consumed.
    pub fn telegram_pattern(&self) -> String {
        self.under(&["stream", "telegram", "+", "from", "#"])
    }

    /// Pattern for device list answers
    pub fn devices_answer_pattern(&self) -> String {
        self.under(&["getAnswer", "devices", "#"])
    }

    /// Every pattern the coordinator subscribes to
    pub fn inbound_patterns(&self) -> Vec<String> {
        vec![
            self.snapshot_pattern(),
            self.delta_pattern(),
            self.telegram_pattern(),
            self.devices_answer_pattern(),
            self.system_info_answer(),
            self.uptime_answer(),
        ]
    }

    /// Device list request
    pub fn get_devices(&self) -> String {
        self.under(&["get", "devices"])
    }

    /// Request for one resource of a device, e.g. `profile`
    pub fn get_device_resource(&self, device_id: &str, resource: &str) -> String {
        self.under(&["get", "devices", device_id, resource])
    }

    /// Answer topic for one resource of a device
    pub fn answer_device_resource(&self, device_id: &str, resource: &str) -> String {
        self.under(&["getAnswer", "devices", device_id, resource])
    }

    /// Write topic for one resource of a device
    pub fn put_device_resource(&self, device_id: &str, resource: &str) -> String {
        self.under(&["put", "devices", device_id, resource])
    }

    /// Command topic of a device
    pub fn put_state(&self, device_id: &str) -> String {
        self.put_device_resource(device_id, "state")
    }

    /// Gateway system information request
    pub fn get_system_info(&self) -> String {
        self.under(&["get", "systemInfo"])
    }

    /// Gateway system information answer
    pub fn system_info_answer(&self) -> String {
        self.under(&["getAnswer", "systemInfo"])
    }

    /// Gateway uptime request
    pub fn get_uptime(&self) -> String {
        self.under(&["get", "uptime"])
    }

    /// Gateway uptime answer
    pub fn uptime_answer(&self) -> String {
        self.under(&["getAnswer", "uptime"])
    }

    /// Classify an inbound topic. Topics outside the known grammar give
    /// `None`.
    pub fn route(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();

        let id_and_path = |from: usize| -> Option<(String, String)> {
            let id = segments.get(from).filter(|id| !id.is_empty())?;
            Some((id.to_string(), segments[from + 1..].join("/")))
        };

        match segments.as_slice() {
            ["stream", "devices", ..] => {
                let (device_id, path) = id_and_path(2)?;
                Some(Route::Snapshot { device_id, path })
            }
            ["stream", "device", ..] => {
                let (device_id, path) = id_and_path(2)?;
                Some(Route::Delta { device_id, path })
            }
            ["stream", "telegram", id, "from", ..] if !id.is_empty() => Some(Route::Telegram {
                device_id: id.to_string(),
                path: segments[4..].join("/"),
            }),
            ["getAnswer", "devices"] => Some(Route::DevicesAnswer { device_id: None }),
            ["getAnswer", "devices", id] if !id.is_empty() => Some(Route::DevicesAnswer {
                device_id: Some(id.to_string()),
            }),
            ["getAnswer", "systemInfo"] => Some(Route::SystemInfo),
            ["getAnswer", "uptime"] => Some(Route::Uptime),
            _ => None,
        }
    }
}

/// Match a topic against an MQTT subscription pattern.
///
/// `+` matches one level, a trailing `#` matches any number of levels
/// including none, so `a/#` matches `a` itself.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("EnOcean", "EAG-1")
    }

    #[test]
    fn test_builders() {
        let t = topics();
        assert_eq!(t.root(), "EnOcean/EAG-1");
        assert_eq!(t.get_devices(), "EnOcean/EAG-1/get/devices");
        assert_eq!(t.put_state("0123ABCD"), "EnOcean/EAG-1/put/devices/0123ABCD/state");
        assert_eq!(
            t.answer_device_resource("0123ABCD", "profile"),
            "EnOcean/EAG-1/getAnswer/devices/0123ABCD/profile"
        );
        assert_eq!(t.telegram_pattern(), "EnOcean/EAG-1/stream/telegram/+/from/#");
        assert_eq!(Topics::new("EnOcean/", "EAG-1").root(), "EnOcean/EAG-1");
    }

    #[test]
    fn test_route_streams() {
        let t = topics();
        assert_eq!(
            t.route("EnOcean/EAG-1/stream/devices/0123ABCD/eeps/0/eep"),
            Some(Route::Snapshot {
                device_id: "0123ABCD".into(),
                path: "eeps/0/eep".into()
            })
        );
        assert_eq!(
            t.route("EnOcean/EAG-1/stream/device/0123ABCD"),
            Some(Route::Delta {
                device_id: "0123ABCD".into(),
                path: String::new()
            })
        );
        assert_eq!(
            t.route("EnOcean/EAG-1/stream/telegram/0123ABCD/from/functions/0/key"),
            Some(Route::Telegram {
                device_id: "0123ABCD".into(),
                path: "functions/0/key".into()
            })
        );
        assert_eq!(t.route("EnOcean/EAG-1/stream/telegram/0123ABCD/to/functions"), None);
    }

    #[test]
    fn test_route_answers() {
        let t = topics();
        assert_eq!(
            t.route("EnOcean/EAG-1/getAnswer/devices"),
            Some(Route::DevicesAnswer { device_id: None })
        );
        assert_eq!(
            t.route("EnOcean/EAG-1/getAnswer/devices/0123ABCD"),
            Some(Route::DevicesAnswer {
                device_id: Some("0123ABCD".into())
            })
        );
        assert_eq!(t.route("EnOcean/EAG-1/getAnswer/devices/0123ABCD/profile"), None);
        assert_eq!(t.route("EnOcean/EAG-1/getAnswer/uptime"), Some(Route::Uptime));
    }

    #[test]
    fn test_route_rejects_foreign_topics() {
        let t = topics();
        assert_eq!(t.route("EnOcean/EAG-2/stream/devices/x/y"), None);
        assert_eq!(t.route("EnOcean/EAG-10/stream/devices/x/y"), None);
        assert_eq!(t.route("EnOcean/EAG-1/stream/devices"), None);
        assert_eq!(t.route("EnOcean/EAG-1/stream/devices//x"), None);
        assert_eq!(t.route("EnOcean/EAG-1/put/devices/x/state"), None);
    }

    #[test]
    fn test_wildcards() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/d"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(matches(
            &topics().telegram_pattern(),
            "EnOcean/EAG-1/stream/telegram/0123ABCD/from"
        ));
    }
}
