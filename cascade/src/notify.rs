// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Outcome notifications
//!
//! Mail is strictly best effort: a failed send is logged and swallowed,
//! it never fails a build or an installation.

use std::collections::BTreeSet;

use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::warn;

use crate::catalog::Database;

/// How much trailing build output makes it into a mail body
const OUTPUT_TAIL: usize = 5000;

#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
    domain: String,
}

impl Mailer {
    /// Plain submission to the configured relay on port 25
    pub fn new(server: &str, sender: &str, domain: &str) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server)
            .port(25)
            .build();

        Self {
            transport,
            sender: format!("{sender}@{domain}"),
            domain: domain.to_owned(),
        }
    }

    /// The mail address of a catalog user name
    pub fn address_of(&self, name: &str) -> String {
        format!("{name}@{}", self.domain)
    }

    /// Mail a build outcome to the event recipients who opted in
    /// (`notify = true`), addressed as catalog name @ domain.
    pub async fn build_outcome(
        &self,
        db: &Database,
        event_emails: &[String],
        repository: &str,
        tag: &str,
        builder: &str,
        success: bool,
        output: &str,
    ) {
        let opted_in = match db.notifiable().await {
            Ok(users) => users
                .into_iter()
                .map(|user| self.address_of(&user.name))
                .collect::<BTreeSet<_>>(),
            Err(e) => {
                warn!(error = %e, "unable to resolve notification recipients");
                return;
            }
        };

        let recipients = event_emails
            .iter()
            .filter(|address| opted_in.contains(*address))
            .cloned()
            .collect::<BTreeSet<_>>();

        let verdict = if success {
            "built successfully"
        } else {
            "build failed"
        };
        let subject = format!("{repository} {tag}: {verdict} on {builder}");

        self.send(recipients, &subject, tail(output)).await;
    }

    /// Mail an unexpected failure to every admin
    pub async fn admin_alert(&self, db: &Database, subject: &str, body: &str) {
        let recipients = match db.admins().await {
            Ok(users) => users
                .into_iter()
                .map(|user| self.address_of(&user.name))
                .collect::<BTreeSet<_>>(),
            Err(e) => {
                warn!(error = %e, "unable to resolve admin recipients");
                return;
            }
        };

        self.send(recipients, subject, body).await;
    }

    /// Mail an arbitrary set of addresses
    pub async fn send(&self, recipients: impl IntoIterator<Item = String>, subject: &str, body: &str) {
        let recipients = recipients.into_iter().collect::<Vec<_>>();

        if recipients.is_empty() {
            return;
        }

        if let Err(e) = self.try_send(&recipients, subject, body).await {
            warn!(error = %e, subject, "failed to send notification");
        }
    }

    async fn try_send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), Error> {
        let mut builder = Message::builder()
            .from(self.sender.parse::<Mailbox>()?)
            .subject(subject);

        for recipient in recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }

        let message = builder.body(body.to_owned())?;

        self.transport.send(message).await?;

        Ok(())
    }
}

/// Trailing slice of build output, aligned to a character boundary
fn tail(output: &str) -> &str {
    let mut start = output.len().saturating_sub(OUTPUT_TAIL);
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("address")]
    Address(#[from] lettre::address::AddressError),
    #[error("message")]
    Message(#[from] lettre::error::Error),
    #[error("smtp")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tail_respects_char_boundaries() {
        let output = "é".repeat(OUTPUT_TAIL);
        assert!(tail(&output).len() <= OUTPUT_TAIL);
        assert!(tail(&output).chars().all(|c| c == 'é'));

        assert_eq!(tail("short"), "short");
    }
}
