use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use rand::RngCore;
use tracing::debug;

use crate::{
    cluster_controller::Ctx,
    crds::cluster::{TypesenseCluster, ADMIN_API_KEY_SECRET_KEY},
    error::ReconcileError,
};

/// Ensure the admin API key secret exists. The secret is create-only: once
/// written (or when the spec references a pre-existing one) it is returned
/// untouched on every subsequent pass.
pub async fn reconcile_secret(
    ctx: &Ctx,
    ts: &TypesenseCluster,
) -> Result<Secret, ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let name = ts.admin_key_secret_name();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);

    if let Some(existing) = secrets.get_opt(&name).await? {
        return Ok(existing);
    }

    debug!(secret = %name, "creating admin api key");

    let secret = Secret {
        metadata: ts.object_meta(&name),
        type_: Some("Opaque".into()),
        string_data: Some(BTreeMap::from([(
            ADMIN_API_KEY_SECRET_KEY.to_string(),
            generate_token(),
        )])),
        ..Default::default()
    };

    let pp = PostParams::default();
    match secrets.create(&pp, &secret).await {
        Ok(created) => Ok(created),
        // Lost a create race with a previous tick; the stored key wins.
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(secrets.get(&name).await?),
        Err(e) => Err(e.into()),
    }
}

/// 256 random bytes, base64-encoded. The encoded form is the key the engine
/// and every client sees; it is never rotated.
pub fn generate_token() -> String {
    let mut token = [0u8; 256];
    rand::thread_rng().fill_bytes(&mut token);
    BASE64.encode(token)
}
