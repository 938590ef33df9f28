//! Rendering of invite and password emails.

use handlebars::Handlebars;
use serde_json::json;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::email::{EmailTemplate, OutboundEmail};
use tiae_core::models::url_token::UrlTokenPurpose;

use crate::config::InviteConfig;

pub struct Mailer {
    handlebars: Handlebars<'static>,
    console_base_url: String,
}

impl Mailer {
    pub fn new(config: &InviteConfig) -> Self {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        // Links carry `=` and must survive verbatim.
        hb.register_escape_fn(handlebars::no_escape);
        Self {
            handlebars: hb,
            console_base_url: config.console_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Console URL redeeming `envelope`.
    pub fn link(&self, purpose: UrlTokenPurpose, envelope: &str) -> String {
        format!(
            "{}/{}?token={}",
            self.console_base_url,
            purpose.console_path(),
            envelope
        )
    }

    pub fn render(
        &self,
        template: &EmailTemplate,
        to: &str,
        company: &str,
        link: &str,
    ) -> TiaeResult<OutboundEmail> {
        let data = json!({ "company": company, "email": to, "link": link });
        let subject = self
            .handlebars
            .render_template(&template.subject, &data)
            .map_err(|e| template_error(template.purpose, e))?;
        let body = self
            .handlebars
            .render_template(&template.body, &data)
            .map_err(|e| template_error(template.purpose, e))?;
        Ok(OutboundEmail {
            to: to.to_string(),
            subject,
            body,
        })
    }

    /// Reject a template that would fail to render for a real recipient.
    pub fn check(&self, template: &EmailTemplate) -> TiaeResult<()> {
        let link = self.link(template.purpose, "preview");
        self.render(template, "preview@example.test", "Preview", &link)
            .map(|_| ())
            .map_err(|e| TiaeError::InvalidArgument(e.to_string()))
    }
}

fn template_error(purpose: UrlTokenPurpose, err: handlebars::RenderError) -> TiaeError {
    TiaeError::Internal(format!("{purpose} email template: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiae_db::store::email_template::default_template;

    fn mailer() -> Mailer {
        Mailer::new(&InviteConfig {
            console_base_url: "https://console.example.test/".into(),
        })
    }

    #[test]
    fn links_point_at_the_console_page() {
        let m = mailer();
        assert_eq!(
            m.link(UrlTokenPurpose::Signup, "abc.def"),
            "https://console.example.test/signup?token=abc.def"
        );
        assert_eq!(
            m.link(UrlTokenPurpose::Forgot, "x"),
            "https://console.example.test/reset-password?token=x"
        );
    }

    #[test]
    fn default_templates_render_every_placeholder() {
        let m = mailer();
        for purpose in [
            UrlTokenPurpose::Signup,
            UrlTokenPurpose::Reset,
            UrlTokenPurpose::Forgot,
        ] {
            let link = m.link(purpose, "tok=en");
            let email = m
                .render(&default_template(purpose), "ada@acme.test", "Acme Inc", &link)
                .unwrap();
            assert_eq!(email.to, "ada@acme.test");
            assert!(email.body.contains(&link), "{purpose} body lacks the link");
            assert!(!email.body.contains("{{"));
            assert!(!email.subject.contains("{{"));
        }
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let template = EmailTemplate {
            purpose: UrlTokenPurpose::Signup,
            subject: "Hi {{nickname}}".into(),
            body: "{{link}}".into(),
        };
        assert!(mailer().render(&template, "a@b.test", "Acme", "l").is_err());
        assert_eq!(
            mailer().check(&template).unwrap_err().kind(),
            tiae_core::error::ErrorKind::InvalidArgument
        );
    }
}
