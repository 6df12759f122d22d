use crate::gateway::DataGateway;
use crate::mail::Mailer;
use crate::payload::WelcomeEmailJobPayload;
use crate::processor::JobProcessor;
use crate::{Job, JobError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::*;

pub const WELCOME_SUBJECT: &str = "Welcome to The Multilingual Files Manager";

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_welcome(display_name: &str) -> String {
    let greeting = format!("<h3>Hello {},</h3>", escape_html(display_name));
    [
        "<div>",
        greeting.as_str(),
        "Welcome to <a href=\"https://github.com/SabirWalid/Multilingual-File-Manager-Application\">",
        "Multilingual File Manager</a>, ",
        "a simple file management API built by ",
        "<a href=\"https://github.com/SabirWalid\">Sabir</a> and ",
        "<a href=\"https://github.com/Islam-19984\">Islam</a>. ",
        "We hope it meets your needs.",
        "</div>",
    ]
    .concat()
}

pub struct WelcomeEmailProcessor {
    gateway: Arc<dyn DataGateway>,
    mailer: Arc<dyn Mailer>,
}

impl WelcomeEmailProcessor {
    pub fn new(gateway: Arc<dyn DataGateway>, mailer: Arc<dyn Mailer>) -> Self {
        WelcomeEmailProcessor { gateway, mailer }
    }
}

#[async_trait]
impl JobProcessor for WelcomeEmailProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload = WelcomeEmailJobPayload::from_payload(&job.payload)?;

        let user = self
            .gateway
            .find_user_by_id(&payload.user_id)
            .await
            .map_err(|err| JobError::processing("looking up user", err))?
            .ok_or_else(|| JobError::not_found("user", payload.user_id.as_str()))?;

        let body = render_welcome(user.display_name());
        let message = self.mailer.build_message(&user.email, WELCOME_SUBJECT, &body);
        self.mailer
            .send_mail(message)
            .await
            .map_err(|err| JobError::processing(format!("sending welcome mail to {}", user.email), err))?;

        info!(message = "Welcome mail dispatched", user_id = %user.id, to = %user.email);
        Ok(())
    }
}
