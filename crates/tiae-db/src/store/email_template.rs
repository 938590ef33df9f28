//! Per-tenant email templates keyed by URL-token purpose.

use sqlx::FromRow;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::email::EmailTemplate;
use tiae_core::models::url_token::UrlTokenPurpose;
use tiae_core::validation::require_non_empty;

use crate::context::TxContext;
use crate::error::db_err;
use crate::store::parse_column;

#[derive(Debug, FromRow)]
struct TemplateRow {
    purpose: String,
    subject: String,
    body: String,
}

impl TryFrom<TemplateRow> for EmailTemplate {
    type Error = TiaeError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(EmailTemplate {
            purpose: parse_column("email_templates.purpose", &row.purpose)?,
            subject: row.subject,
            body: row.body,
        })
    }
}

/// Built-in template for `purpose`, used to seed new tenants.
pub fn default_template(purpose: UrlTokenPurpose) -> EmailTemplate {
    let (subject, body) = match purpose {
        UrlTokenPurpose::Signup => (
            "Welcome to {{company}}",
            "Hello,\n\nAn account was created for {{email}} at {{company}}.\n\
             Choose a password to get started:\n\n{{link}}\n",
        ),
        UrlTokenPurpose::Reset => (
            "Set a new password for {{company}}",
            "Hello,\n\nA password reset was requested for {{email}} at {{company}}.\n\
             Follow this link to set a new password:\n\n{{link}}\n",
        ),
        UrlTokenPurpose::Forgot => (
            "Forgot your {{company}} password?",
            "Hello,\n\nWe received a request to recover the account {{email}} at {{company}}.\n\
             If it was you, follow this link:\n\n{{link}}\n\n\
             Otherwise you can ignore this message.\n",
        ),
    };
    EmailTemplate {
        purpose,
        subject: subject.into(),
        body: body.into(),
    }
}

/// Insert the built-in templates into the attached tenant's schema.
/// Existing rows are kept.
pub async fn seed_defaults(ctx: &mut TxContext) -> TiaeResult<()> {
    let conn = ctx.tenant_tx().await?;
    for purpose in [
        UrlTokenPurpose::Signup,
        UrlTokenPurpose::Reset,
        UrlTokenPurpose::Forgot,
    ] {
        let template = default_template(purpose);
        sqlx::query(
            "INSERT INTO email_templates (purpose, subject, body) VALUES ($1, $2, $3) \
             ON CONFLICT (purpose) DO NOTHING",
        )
        .bind(purpose.as_str())
        .bind(&template.subject)
        .bind(&template.body)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

/// The tenant's template for `purpose`, falling back to the built-in one
/// when the row is missing.
pub async fn get_template(ctx: &mut TxContext, purpose: UrlTokenPurpose) -> TiaeResult<EmailTemplate> {
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, TemplateRow>(
        "SELECT purpose, subject, body FROM email_templates WHERE purpose = $1",
    )
    .bind(purpose.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    match row {
        Some(row) => row.try_into(),
        None => Ok(default_template(purpose)),
    }
}

pub async fn set_template(ctx: &mut TxContext, template: &EmailTemplate) -> TiaeResult<()> {
    require_non_empty("template subject", &template.subject)?;
    require_non_empty("template body", &template.body)?;
    let conn = ctx.tenant_tx().await?;
    sqlx::query(
        "INSERT INTO email_templates (purpose, subject, body) VALUES ($1, $2, $3) \
         ON CONFLICT (purpose) DO UPDATE \
         SET subject = EXCLUDED.subject, body = EXCLUDED.body, updated_at = now()",
    )
    .bind(template.purpose.as_str())
    .bind(&template.subject)
    .bind(&template.body)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reference_every_placeholder() {
        for purpose in [
            UrlTokenPurpose::Signup,
            UrlTokenPurpose::Reset,
            UrlTokenPurpose::Forgot,
        ] {
            let t = default_template(purpose);
            assert_eq!(t.purpose, purpose);
            assert!(t.subject.contains("{{company}}"));
            for placeholder in ["{{email}}", "{{company}}", "{{link}}"] {
                assert!(t.body.contains(placeholder), "{purpose} lacks {placeholder}");
            }
        }
    }
}
