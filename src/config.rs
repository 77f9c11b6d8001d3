//! Engine configuration.
//!
//! [`EngineConfig`] is handed to [`Manager::new`](crate::Manager::new) and
//! replaces compile-time feature toggles with runtime values. It can be
//! deserialised from TOML so the binary accepts a `--config` file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest growth factor accepted by [`EngineConfig::normalized`].
const MIN_GROWTH_FACTOR: f64 = 1.1;
/// Largest growth factor accepted by [`EngineConfig::normalized`].
const MAX_GROWTH_FACTOR: f64 = 4.0;
/// Floor applied to every byte-count limit.
const MIN_LIMIT: usize = 64;

/// Runtime configuration for one [`Manager`](crate::Manager) instance.
///
/// # Default Values
/// - `max_http_headers`: 20
/// - `max_dns_questions` / `max_dns_answers`: 32
/// - `buffer_growth_factor`: 1.5
/// - `recv_buffer_limit`: 16 MiB
/// - `read_chunk_size`: 2048 bytes
/// - `max_broadcast_message`: 8192 bytes
/// - `mqtt_max_qos`: 2
/// - `mqtt_max_packet_size`: 256 KiB
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Allow TLS to be requested through [`BindOptions`](crate::BindOptions).
    pub tls: bool,
    /// Create the cross-thread broadcast channel.
    pub multithreading: bool,
    /// Maximum number of header lines kept per HTTP message.
    pub max_http_headers: usize,
    /// Maximum number of DNS questions parsed per message.
    pub max_dns_questions: usize,
    /// Maximum number of DNS answers parsed per message.
    pub max_dns_answers: usize,
    /// Multiplier applied to a buffer's capacity when it must grow.
    pub buffer_growth_factor: f64,
    /// Receive buffer ceiling for new connections.
    pub recv_buffer_limit: usize,
    /// Bytes read from a socket per read call.
    pub read_chunk_size: usize,
    /// Largest payload accepted by [`Broadcaster::send`](crate::Broadcaster::send).
    pub max_broadcast_message: usize,
    /// Emit per-part multipart events instead of buffering whole bodies.
    pub http_streaming_multipart: bool,
    /// Highest QoS the MQTT broker grants to subscribers.
    pub mqtt_max_qos: u8,
    /// Largest MQTT packet accepted by the decoder.
    pub mqtt_max_packet_size: usize,
    /// Resolver defaults.
    pub dns: DnsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tls: false,
            multithreading: true,
            max_http_headers: 20,
            max_dns_questions: 32,
            max_dns_answers: 32,
            buffer_growth_factor: 1.5,
            recv_buffer_limit: 16 * 1024 * 1024,
            read_chunk_size: 2048,
            max_broadcast_message: 8192,
            http_streaming_multipart: false,
            mqtt_max_qos: 2,
            mqtt_max_packet_size: 256 * 1024,
            dns: DnsConfig::default(),
        }
    }
}

/// Resolver defaults applied when a lookup does not override them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Nameserver address such as `udp://8.8.8.8:53`; `None` reads
    /// `/etc/resolv.conf`.
    pub nameserver: Option<String>,
    /// Time to wait for an answer before retrying.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Retransmissions before the lookup fails.
    pub max_retries: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameserver: None,
            timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

impl EngineConfig {
    /// Set the maximum number of parsed HTTP headers.
    #[must_use]
    pub fn with_max_http_headers(mut self, n: usize) -> Self {
        self.max_http_headers = n;
        self
    }

    /// Set the buffer growth factor.
    #[must_use]
    pub fn with_buffer_growth_factor(mut self, factor: f64) -> Self {
        self.buffer_growth_factor = factor;
        self
    }

    /// Set the receive buffer ceiling for new connections.
    #[must_use]
    pub fn with_recv_buffer_limit(mut self, limit: usize) -> Self {
        self.recv_buffer_limit = limit;
        self
    }

    /// Enable or disable streaming multipart events.
    #[must_use]
    pub fn with_http_streaming_multipart(mut self, enabled: bool) -> Self {
        self.http_streaming_multipart = enabled;
        self
    }

    /// Cap the QoS granted by the MQTT broker.
    #[must_use]
    pub fn with_mqtt_max_qos(mut self, qos: u8) -> Self {
        self.mqtt_max_qos = qos;
        self
    }

    /// Enable or disable the broadcast channel.
    #[must_use]
    pub fn with_multithreading(mut self, enabled: bool) -> Self {
        self.multithreading = enabled;
        self
    }

    /// Replace the resolver defaults.
    #[must_use]
    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = dns;
        self
    }

    /// Clamp values to workable bounds.
    ///
    /// Growth factors outside `1.1..=4.0` (or NaN) fall back into range, byte
    /// limits are raised to a small floor and the broker QoS cap is clamped
    /// to 2.
    ///
    /// # Examples
    ///
    /// ```
    /// use netmux::EngineConfig;
    ///
    /// let cfg = EngineConfig::default()
    ///     .with_buffer_growth_factor(0.5)
    ///     .with_mqtt_max_qos(9)
    ///     .normalized();
    /// assert!((cfg.buffer_growth_factor - 1.1).abs() < f64::EPSILON);
    /// assert_eq!(cfg.mqtt_max_qos, 2);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.buffer_growth_factor = if self.buffer_growth_factor.is_nan() {
            EngineConfig::default().buffer_growth_factor
        } else {
            self.buffer_growth_factor
                .clamp(MIN_GROWTH_FACTOR, MAX_GROWTH_FACTOR)
        };
        self.recv_buffer_limit = self.recv_buffer_limit.max(MIN_LIMIT);
        self.read_chunk_size = self.read_chunk_size.max(MIN_LIMIT);
        self.max_broadcast_message = self.max_broadcast_message.max(1);
        self.mqtt_max_packet_size = self.mqtt_max_packet_size.max(MIN_LIMIT);
        self.mqtt_max_qos = self.mqtt_max_qos.min(2);
        self.max_http_headers = self.max_http_headers.max(1);
        self.dns.timeout = self.dns.timeout.max(Duration::from_millis(1));
        self
    }

    /// Parse a TOML document, filling omitted fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`toml::de::Error`] when the document is not valid TOML or a
    /// field has the wrong type.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Self>(text).map(Self::normalized)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::EngineConfig;

    #[test]
    fn toml_overrides_only_named_fields() {
        let cfg = EngineConfig::from_toml(
            "max_http_headers = 40\n[dns]\ntimeout = 0.5\nnameserver = \"udp://1.1.1.1:53\"\n",
        )
        .expect("valid toml");
        assert_eq!(cfg.max_http_headers, 40);
        assert_eq!(cfg.dns.timeout, Duration::from_millis(500));
        assert_eq!(cfg.dns.nameserver.as_deref(), Some("udp://1.1.1.1:53"));
        assert_eq!(cfg.dns.max_retries, 2);
        assert_eq!(cfg.max_dns_answers, 32);
    }

    #[rstest]
    #[case(0.0, 1.1)]
    #[case(1.5, 1.5)]
    #[case(10.0, 4.0)]
    #[case(f64::NAN, 1.5)]
    fn growth_factor_is_clamped(#[case] input: f64, #[case] expected: f64) {
        let cfg = EngineConfig::default()
            .with_buffer_growth_factor(input)
            .normalized();
        assert!((cfg.buffer_growth_factor - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_limits_are_raised() {
        let cfg = EngineConfig {
            recv_buffer_limit: 0,
            max_broadcast_message: 0,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(cfg.recv_buffer_limit, 64);
        assert_eq!(cfg.max_broadcast_message, 1);
    }
}
