/*!
 * Shipment notifications
 *
 * After a decrement batch commits, the shipped items are reported to the
 * external shipping service. Delivery is best-effort: a notifier never
 * returns an error, and the outcome is only logged.
 */

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn, Instrument};

/// One decremented line of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippedItem {
    pub product_code: String,
    pub quantity: i32,
}

/// Items shipped by one committed batch, in batch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentNotice {
    pub recipient: String,
    pub items: Vec<ShippedItem>,
}

impl ShipmentNotice {
    pub fn subject(&self) -> String {
        format!("Shipment confirmation for {}", self.recipient)
    }

    pub fn render_body(&self) -> String {
        let mut body = format!(
            "Sending shipment confirmation to {} for the following products:\n",
            self.recipient
        );
        for item in &self.items {
            let _ = writeln!(body, "{}: {} pcs", item.product_code, item.quantity);
        }
        body
    }
}

/// Wire payload posted to the shipping service
#[derive(Debug, Serialize, Deserialize)]
pub struct ShippingMessage {
    pub subject: String,
    pub body: String,
}

impl From<&ShipmentNotice> for ShippingMessage {
    fn from(notice: &ShipmentNotice) -> Self {
        Self {
            subject: notice.subject(),
            body: notice.render_body(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub status: Option<u16>,
    pub detail: String,
}

impl DeliveryOutcome {
    fn delivered(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            delivered: true,
            status,
            detail: detail.into(),
        }
    }

    fn failed(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            delivered: false,
            status,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ShipmentNotifier: Send + Sync {
    /// Delivers `notice` on behalf of the caller identified by `token`.
    async fn notify(&self, token: &str, notice: &ShipmentNotice) -> DeliveryOutcome;
}

/// Posts notices to the shipping service. Only HTTP 200 counts as delivered;
/// failed deliveries are not retried.
#[derive(Clone)]
pub struct HttpShipmentNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpShipmentNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ShipmentNotifier for HttpShipmentNotifier {
    #[instrument(skip(self, token, notice), fields(endpoint = %self.endpoint, items = notice.items.len()))]
    async fn notify(&self, token: &str, notice: &ShipmentNotice) -> DeliveryOutcome {
        let message = ShippingMessage::from(notice);

        match self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&message)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::OK {
                    DeliveryOutcome::delivered(Some(status.as_u16()), "shipping service accepted notice")
                } else {
                    let text = response.text().await.unwrap_or_default();
                    DeliveryOutcome::failed(
                        Some(status.as_u16()),
                        format!("shipping service responded {}: {}", status, text),
                    )
                }
            }
            Err(e) => DeliveryOutcome::failed(None, format!("shipping request failed: {}", e)),
        }
    }
}

/// Used when no shipping endpoint is configured.
#[derive(Clone, Debug, Default)]
pub struct LoggingShipmentNotifier;

#[async_trait]
impl ShipmentNotifier for LoggingShipmentNotifier {
    async fn notify(&self, _token: &str, notice: &ShipmentNotice) -> DeliveryOutcome {
        info!(recipient = %notice.recipient, "{}", notice.render_body());
        DeliveryOutcome::delivered(None, "logged")
    }
}

/// Hands `notice` to `notifier` on a detached task. The returned handle may be
/// dropped; the outcome is logged either way.
pub fn dispatch_detached(
    notifier: Arc<dyn ShipmentNotifier>,
    token: String,
    notice: ShipmentNotice,
) -> JoinHandle<DeliveryOutcome> {
    let span = tracing::info_span!("shipment_notice", recipient = %notice.recipient);
    tokio::spawn(
        async move {
            let outcome = notifier.notify(&token, &notice).await;
            if outcome.delivered {
                counter!("inventory_notifier.delivered", 1);
                info!(status = ?outcome.status, detail = %outcome.detail, "shipment notice delivered");
            } else {
                counter!("inventory_notifier.failed", 1);
                warn!(status = ?outcome.status, detail = %outcome.detail, "shipment notice not delivered");
            }
            outcome
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notice() -> ShipmentNotice {
        ShipmentNotice {
            recipient: "buyer@example.com".into(),
            items: vec![
                ShippedItem {
                    product_code: "A".into(),
                    quantity: 4,
                },
                ShippedItem {
                    product_code: "B".into(),
                    quantity: 5,
                },
            ],
        }
    }

    #[test]
    fn body_lists_every_item_in_order() {
        let body = notice().render_body();
        let a = body.find("A: 4 pcs").unwrap();
        let b = body.find("B: 5 pcs").unwrap();
        assert!(a < b);
        assert!(body.contains("buyer@example.com"));
    }

    #[tokio::test]
    async fn http_notifier_posts_bearer_and_json() {
        let server = MockServer::start().await;
        let expected = serde_json::json!({
            "subject": notice().subject(),
            "body": notice().render_body(),
        });
        Mock::given(method("POST"))
            .and(path("/shipping"))
            .and(header("authorization", "Bearer token-123"))
            .and(body_json(expected))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            HttpShipmentNotifier::new(format!("{}/shipping", server.uri()), Duration::from_secs(2))
                .unwrap();
        let outcome = notifier.notify("token-123", &notice()).await;

        assert!(outcome.delivered);
        assert_eq!(outcome.status, Some(200));
    }

    #[tokio::test]
    async fn non_200_is_a_failed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpShipmentNotifier::new(server.uri(), Duration::from_secs(2)).unwrap();
        let outcome = notifier.notify("t", &notice()).await;

        assert!(!outcome.delivered);
        assert_eq!(outcome.status, Some(201));
    }

    #[tokio::test]
    async fn transport_errors_are_absorbed() {
        // Nothing listens on port 9 locally.
        let notifier =
            HttpShipmentNotifier::new("http://127.0.0.1:9/shipping", Duration::from_millis(500))
                .unwrap();
        let outcome = notifier.notify("t", &notice()).await;

        assert!(!outcome.delivered);
        assert_eq!(outcome.status, None);
    }

    #[tokio::test]
    async fn dispatch_detached_reports_the_outcome() {
        let handle = dispatch_detached(
            Arc::new(LoggingShipmentNotifier),
            "t".into(),
            notice(),
        );
        let outcome = handle.await.unwrap();
        assert!(outcome.delivered);
    }
}
