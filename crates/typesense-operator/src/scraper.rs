use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::{
    cluster_controller::Ctx,
    crds::cluster::{DocSearchScraperSpec, TypesenseCluster, ADMIN_API_KEY_SECRET_KEY},
    error::ReconcileError,
};

/// Doc-search scraper cron jobs. Jobs with no matching declaration are
/// pruned; drifted jobs are dropped and recreated since most cron job fields
/// are immutable in place.
pub async fn reconcile_scrapers(ctx: &Ctx, ts: &TypesenseCluster) -> Result<(), ReconcileError> {
    let ns = ts.namespace().unwrap_or_default();
    let cron_jobs: Api<CronJob> = Api::namespaced(ctx.client.clone(), &ns);

    let declared = ts.spec.scrapers.clone().unwrap_or_default();

    let lp = ListParams::default().labels(&format!("app={}", ts.sts_name()));
    for job in cron_jobs.list(&lp).await? {
        let job_name = job.name_any();
        let still_declared = declared
            .iter()
            .any(|scraper| job_name == scraper_job_name(scraper));
        if !still_declared {
            info!(cronjob = %job_name, "deleting undeclared scraper");
            match cron_jobs.delete(&job_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    for scraper in &declared {
        let name = scraper_job_name(scraper);
        match cron_jobs.get_opt(&name).await? {
            None => {
                info!(cronjob = %name, "creating scraper");
                let pp = PostParams::default();
                cron_jobs.create(&pp, &build_scraper(ts, scraper)).await?;
            }
            Some(existing) if scraper_drifted(&existing, scraper) => {
                info!(cronjob = %name, "recreating drifted scraper");
                cron_jobs.delete(&name, &DeleteParams::default()).await?;
                let pp = PostParams::default();
                cron_jobs.create(&pp, &build_scraper(ts, scraper)).await?;
            }
            Some(_) => debug!(cronjob = %name, "scraper up to date"),
        }
    }
    Ok(())
}

fn scraper_job_name(scraper: &DocSearchScraperSpec) -> String {
    format!("{}-scraper", scraper.name)
}

fn scraper_drifted(existing: &CronJob, scraper: &DocSearchScraperSpec) -> bool {
    let Some(spec) = existing.spec.as_ref() else {
        return true;
    };
    if spec.schedule != scraper.schedule {
        return true;
    }

    let Some(container) = spec
        .job_template
        .spec
        .as_ref()
        .and_then(|j| j.template.spec.as_ref())
        .and_then(|p| p.containers.first())
    else {
        return true;
    };
    if container.image.as_deref() != Some(scraper.image.as_str()) {
        return true;
    }

    let config = container
        .env
        .as_ref()
        .and_then(|env| env.iter().find(|e| e.name == "CONFIG"))
        .and_then(|e| e.value.as_deref());
    config != Some(scraper.config.as_str())
}

fn build_scraper(ts: &TypesenseCluster, scraper: &DocSearchScraperSpec) -> CronJob {
    CronJob {
        metadata: ts.object_meta(&scraper_job_name(scraper)),
        spec: Some(CronJobSpec {
            schedule: scraper.schedule.clone(),
            concurrency_policy: Some("Forbid".into()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    backoff_limit: Some(0),
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".into()),
                            containers: vec![Container {
                                name: format!("{}-docsearch-scraper", scraper.name),
                                image: Some(scraper.image.clone()),
                                env: Some(vec![
                                    EnvVar {
                                        name: "CONFIG".into(),
                                        value: Some(scraper.config.clone()),
                                        ..Default::default()
                                    },
                                    EnvVar {
                                        name: "TYPESENSE_API_KEY".into(),
                                        value_from: Some(EnvVarSource {
                                            secret_key_ref: Some(SecretKeySelector {
                                                name: ts.admin_key_secret_name(),
                                                key: ADMIN_API_KEY_SECRET_KEY.into(),
                                                optional: Some(false),
                                            }),
                                            ..Default::default()
                                        }),
                                        ..Default::default()
                                    },
                                    EnvVar {
                                        name: "TYPESENSE_HOST".into(),
                                        value: Some(ts.rest_service_name()),
                                        ..Default::default()
                                    },
                                    EnvVar {
                                        name: "TYPESENSE_PORT".into(),
                                        value: Some(ts.spec.api_port.to_string()),
                                        ..Default::default()
                                    },
                                    EnvVar {
                                        name: "TYPESENSE_PROTOCOL".into(),
                                        value: Some("http".into()),
                                        ..Default::default()
                                    },
                                ]),
                                resources: Some(scraper_resources()),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn scraper_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("128m".into())),
            ("memory".to_string(), Quantity("112Mi".into())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("1024m".into())),
            ("memory".to_string(), Quantity("512Mi".into())),
        ])),
        ..Default::default()
    }
}
