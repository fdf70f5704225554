//! Prometheus metrics definitions and collection logic.
//!
//! This module defines all Prometheus metrics exposed by the exporter and
//! keeps them in sync with the Altaro VM listing. Each collector owns its
//! own [`Registry`]; nothing is registered globally.

use crate::client::AltaroClient;
use crate::config::OptionsConfig;
use crate::error::{AltaroError, Result};
use crate::mapper::{JobStats, VmRecord};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const VM_LABELS: [&str; 3] = ["vmname", "hostname", "vmuuid"];

fn metrics_err(e: prometheus::Error) -> AltaroError {
    AltaroError::Metrics(e.to_string())
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help)).map_err(metrics_err)?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(metrics_err)?;
    Ok(gauge)
}

fn register_vm_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), &VM_LABELS).map_err(metrics_err)?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(metrics_err)?;
    Ok(gauge)
}

/// Gauges for one job kind, e.g. `altaro_lastbackup_*`.
#[derive(Clone)]
struct JobGauges {
    timestamp: GaugeVec,
    duration_seconds: GaugeVec,
    transfer_compressed_bytes: GaugeVec,
    transfer_uncompressed_bytes: GaugeVec,
    result: GaugeVec,
}

impl JobGauges {
    fn new(registry: &Registry, prefix: &str, job: &str) -> Result<Self> {
        Ok(Self {
            timestamp: register_vm_gauge(
                registry,
                &format!("{}_timestamp", prefix),
                &format!("Timestamp of last {}", job),
            )?,
            duration_seconds: register_vm_gauge(
                registry,
                &format!("{}_duration_seconds", prefix),
                &format!("Duration of last {} in seconds", job),
            )?,
            transfer_compressed_bytes: register_vm_gauge(
                registry,
                &format!("{}_transfersize_compressed_bytes", prefix),
                &format!("Compressed transfer size of last {} in bytes", job),
            )?,
            transfer_uncompressed_bytes: register_vm_gauge(
                registry,
                &format!("{}_transfersize_uncompressed_bytes", prefix),
                &format!("Uncompressed transfer size of last {} in bytes", job),
            )?,
            result: register_vm_gauge(
                registry,
                &format!("{}_result", prefix),
                &format!(
                    "Result of last {} (0=success, 1=warning, 2=error, 3=unknown, 4=other)",
                    job
                ),
            )?,
        })
    }

    fn reset(&self) {
        self.timestamp.reset();
        self.duration_seconds.reset();
        self.transfer_compressed_bytes.reset();
        self.transfer_uncompressed_bytes.reset();
        self.result.reset();
    }

    fn set(&self, labels: &[&str], stats: &JobStats) {
        let values = [
            (&self.timestamp, stats.timestamp),
            (&self.duration_seconds, stats.duration_seconds),
            (&self.transfer_compressed_bytes, stats.transfer_compressed_bytes),
            (&self.transfer_uncompressed_bytes, stats.transfer_uncompressed_bytes),
            (&self.result, stats.result.map(|r| r.code())),
        ];
        for (gauge, value) in values {
            if let Some(value) = value {
                gauge.with_label_values(labels).set(value);
            }
        }
    }
}

/// Metrics collector for the Altaro exporter.
pub struct MetricsCollector {
    // Guards the session and the whole refresh sequence
    client: Mutex<AltaroClient>,
    registry: Registry,
    options: OptionsConfig,

    // Exporter metrics
    api_success: Gauge,
    vms: Gauge,

    // Per-VM metrics
    vm_scheduled: GaugeVec,
    last_backup: JobGauges,
    last_offsite_copy: JobGauges,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry.
    pub fn new(client: AltaroClient, options: OptionsConfig) -> Result<Self> {
        let registry = Registry::new();

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .map_err(metrics_err)?;

        let api_success = register_gauge(
            &registry,
            "altaro_api_success",
            "Altaro API request status (0 = success, 1 = cannot connect, 2 = API error)",
        )?;
        let vms = register_gauge(&registry, "altaro_vms", "Number of VMs currently exported")?;

        let vm_scheduled = register_vm_gauge(
            &registry,
            "altaro_vm_scheduled",
            "Whether a next backup or offsite copy is scheduled (1 = yes, 0 = no)",
        )?;
        let last_backup = JobGauges::new(&registry, "altaro_lastbackup", "backup")?;
        let last_offsite_copy =
            JobGauges::new(&registry, "altaro_lastoffsitecopy", "offsite copy")?;

        Ok(Self {
            client: Mutex::new(client),
            registry,
            options,
            api_success,
            vms,
            vm_scheduled,
            last_backup,
            last_offsite_copy,
        })
    }

    /// Refresh all metrics from the Altaro API.
    ///
    /// On failure the previous VM metrics are kept and only
    /// `altaro_api_success` changes.
    pub async fn collect(&self) -> Result<()> {
        let mut client = self.client.lock().await;
        self.collect_locked(&mut client).await
    }

    async fn collect_locked(&self, client: &mut AltaroClient) -> Result<()> {
        info!("Collecting metrics from Altaro API");

        let result = client
            .list_vms(
                self.options.include_unconfigured,
                self.options.include_non_scheduled,
            )
            .await;
        self.api_success.set(client.health().code());

        match result {
            Ok(records) => {
                self.apply(&records);
                info!("Successfully collected metrics");
                Ok(())
            }
            Err(e) => {
                error!("Failed to collect metrics: {}", e);
                Err(e)
            }
        }
    }

    /// Replace the VM metrics with `records`.
    ///
    /// Every label set is dropped first: VMs that were deleted, renamed or
    /// deconfigured since the last refresh must not linger.
    pub fn apply(&self, records: &[VmRecord]) {
        self.vm_scheduled.reset();
        self.last_backup.reset();
        self.last_offsite_copy.reset();

        debug!("Updating VM metrics for {} VMs", records.len());
        for vm in records {
            let labels = vm.labels();
            self.vm_scheduled
                .with_label_values(&labels)
                .set(if vm.scheduled { 1.0 } else { 0.0 });
            self.last_backup.set(&labels, &vm.last_backup);
            self.last_offsite_copy.set(&labels, &vm.last_offsite_copy);
        }
        self.vms.set(records.len() as f64);
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::with_capacity(8192);
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(metrics_err)?;

        String::from_utf8(buffer).map_err(|e| AltaroError::Metrics(e.to_string()))
    }

    /// Refresh, then render, as one step.
    ///
    /// The refresh lock is held until the text is rendered, so concurrent
    /// scrapes queue up and never see a half-applied listing. A failed
    /// refresh is logged and the last good metrics are rendered.
    pub async fn refresh_and_render(&self) -> Result<String> {
        let mut client = self.client.lock().await;
        if let Err(e) = self.collect_locked(&mut client).await {
            warn!("Rendering previous metrics after failed refresh: {}", e);
        }
        self.encode()
    }

    /// Log in ahead of the first scrape. Failure is not fatal.
    pub async fn connect(&self) {
        let mut client = self.client.lock().await;
        if let Err(e) = client.login().await {
            warn!("Initial login failed, will retry on first scrape: {}", e);
        }
    }

    /// Close the upstream session.
    pub async fn shutdown(&self) {
        self.client.lock().await.logout().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::mapper::BackupResult;

    fn collector() -> MetricsCollector {
        let mut config = Settings::default().altaro_server;
        config.username = "Administrator".to_string();
        config.password = "secret".to_string();
        let client = AltaroClient::new(config).unwrap();
        MetricsCollector::new(client, OptionsConfig::default()).unwrap()
    }

    fn record(name: &str) -> VmRecord {
        VmRecord {
            vm_name: name.to_string(),
            host_name: "hyperv01".to_string(),
            vm_uuid: format!("uuid-{}", name),
            scheduled: true,
            last_backup: JobStats {
                timestamp: Some(1723513994.0),
                duration_seconds: Some(120.0),
                transfer_compressed_bytes: Some(1024.0),
                transfer_uncompressed_bytes: Some(4096.0),
                result: Some(BackupResult::Success),
            },
            last_offsite_copy: JobStats::default(),
        }
    }

    fn altaro_lines(text: &str) -> Vec<&str> {
        text.lines().filter(|l| l.starts_with("altaro_")).collect()
    }

    #[test]
    fn test_each_collector_has_its_own_registry() {
        let a = collector();
        let b = collector();
        a.apply(&[record("vm-a")]);

        assert!(a.encode().unwrap().contains(r#"vmname="vm-a""#));
        assert!(!b.encode().unwrap().contains(r#"vmname="vm-a""#));
    }

    #[test]
    fn test_apply_sets_values() {
        let metrics = collector();
        metrics.apply(&[record("dc01")]);
        let text = metrics.encode().unwrap();

        assert!(text.contains(
            r#"altaro_lastbackup_duration_seconds{hostname="hyperv01",vmname="dc01",vmuuid="uuid-dc01"} 120"#
        ));
        assert!(text.contains(
            r#"altaro_lastbackup_result{hostname="hyperv01",vmname="dc01",vmuuid="uuid-dc01"} 0"#
        ));
        assert!(text.contains(
            r#"altaro_vm_scheduled{hostname="hyperv01",vmname="dc01",vmuuid="uuid-dc01"} 1"#
        ));
        assert!(text.contains("altaro_vms 1"));
    }

    #[test]
    fn test_absent_fields_produce_no_sample() {
        let metrics = collector();
        metrics.apply(&[record("dc01")]);
        let text = metrics.encode().unwrap();

        // The offsite copy block is empty
        assert!(!text.contains(r#"altaro_lastoffsitecopy_timestamp{"#));
        assert!(!text.contains(r#"altaro_lastoffsitecopy_result{"#));
    }

    #[test]
    fn test_stale_vms_are_removed() {
        let metrics = collector();
        metrics.apply(&[record("vm-a"), record("vm-b")]);
        assert!(metrics.encode().unwrap().contains(r#"vmname="vm-b""#));

        metrics.apply(&[record("vm-a")]);
        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"vmname="vm-a""#));
        assert!(!text.contains(r#"vmname="vm-b""#));
        assert!(text.contains("altaro_vms 1"));
    }

    #[test]
    fn test_same_listing_renders_identically() {
        let metrics = collector();
        let listing = [record("vm-a"), record("vm-b")];

        metrics.apply(&listing);
        let first = metrics.encode().unwrap();
        metrics.apply(&listing);
        let second = metrics.encode().unwrap();

        assert_eq!(altaro_lines(&first), altaro_lines(&second));
    }
}
