use tiae_core::error::TiaeResult;
use tiae_core::models::email::EmailTemplate;
use tiae_core::models::url_token::UrlTokenPurpose;
use tiae_db::store::email_template;
use tracing::info;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    pub async fn get_email_template(
        &self,
        call: &Call,
        tenant: &str,
        purpose: UrlTokenPurpose,
    ) -> TiaeResult<EmailTemplate> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            email_template::get_template(&mut ctx, purpose).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Replace the tenant's template for one purpose. Admin only; the
    /// template must render with the standard placeholders.
    pub async fn set_email_template(
        &self,
        call: &Call,
        tenant: &str,
        template: EmailTemplate,
    ) -> TiaeResult<()> {
        call.require_admin()?;
        self.mailer.check(&template)?;
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            email_template::set_template(&mut ctx, &template).await
        }
        .await;
        self.finish(ctx, result).await?;
        info!(tenant, purpose = %template.purpose, "Email template updated");
        Ok(())
    }
}
