use serde::Deserialize;
use url::Url;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::payment::{
    CardDetails, CardProcessor, ClientSecret, PaymentMethodId, ProcessorError, ProcessorIntent,
    ProcessorResponse,
};

/// Card processor client speaking the Stripe-style REST API with a
/// publishable key.
#[derive(Clone)]
pub struct HttpCardProcessor {
    base_url: Url,
    publishable_key: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ProcessorError,
}

#[derive(Deserialize)]
struct MethodObject {
    id: String,
}

impl HttpCardProcessor {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no processor key is configured or the
    /// HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let publishable_key = config
            .processor_key()
            .ok_or_else(|| Error::Config("processor key is required".into()))?
            .to_owned();
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent())
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: config.processor_url().clone(),
            publishable_key,
            http,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<Result<reqwest::Response, ProcessorError>, Error> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Config(format!("processor endpoint {path}: {e}")))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.publishable_key)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
                return Ok(Err(envelope.error));
            }
        }
        Err(Error::Unknown(format!("processor HTTP {}: {body}", status.as_u16())))
    }
}

impl CardProcessor for HttpCardProcessor {
    async fn create_payment_method(&self, card: &CardDetails) -> Result<PaymentMethodId, Error> {
        let mut form = vec![
            ("type", "card".to_owned()),
            ("card[number]", card.number.clone()),
            ("card[exp_month]", card.exp_month.to_string()),
            ("card[exp_year]", card.exp_year.to_string()),
            ("card[cvc]", card.cvc.clone()),
        ];
        if let Some(name) = &card.holder_name {
            form.push(("billing_details[name]", name.clone()));
        }

        match self.post_form("v1/payment_methods", &form).await? {
            Ok(response) => {
                let method: MethodObject = response
                    .json()
                    .await
                    .map_err(|e| Error::Unknown(format!("payment method: {e}")))?;
                Ok(PaymentMethodId(method.id))
            }
            Err(err) => {
                tracing::info!(code = ?err.code, "Card rejected during tokenization");
                Err(Error::PaymentDeclined(err.message))
            }
        }
    }

    async fn confirm_card_payment(
        &self,
        client_secret: &ClientSecret,
        payment_method: &PaymentMethodId,
    ) -> Result<ProcessorResponse, Error> {
        let path = format!(
            "v1/payment_intents/{}/confirm",
            urlencoding::encode(client_secret.intent_id())
        );
        let form = [
            ("client_secret", client_secret.as_str().to_owned()),
            ("payment_method", payment_method.0.clone()),
        ];

        match self.post_form(&path, &form).await? {
            Ok(response) => {
                let intent: ProcessorIntent = response
                    .json()
                    .await
                    .map_err(|e| Error::Unknown(format!("payment intent: {e}")))?;
                Ok(ProcessorResponse {
                    error: None,
                    payment_intent: Some(intent),
                })
            }
            Err(error) => Ok(ProcessorResponse {
                error: Some(error),
                payment_intent: None,
            }),
        }
    }
}
