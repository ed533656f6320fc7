//! Acquire/yield/shutdown sequencing for one sandbox
//!
//! Mirrors the four-part contract the frontend's Provider client speaks:
//! acquire a target system, let the attacker session run against it, yield
//! it back (harvesting whatever it downloaded), and on process shutdown
//! force-remove whatever is left labeled as ours.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt;

use honeypot_core::backoff::ExponentialBackoff;
use honeypot_protocol::DownloadEvent;

use super::*;

const READINESS_ATTEMPTS: u32 = 30;
const EXIT_ATTEMPTS: u32 = 30;

impl SandboxOrchestrator {
    /// Provision a fresh target system for `user`/`password`. On any
    /// failure partway through, everything created so far is force-removed
    /// before the error is returned, so no orphan containers/networks
    /// survive a failed acquire.
    pub async fn acquire(&self, user: &str, password: &str) -> Result<SandboxRecord, SandboxError> {
        if let Some(max) = self.config.max_concurrent_target_systems {
            if self.registry.len() as u32 >= max {
                return Err(SandboxError::CapacityExceeded(max));
            }
        }

        let id = TargetSystemId::new(rand::random::<u32>());
        let suffix = format!("{:08x}", id.as_u32());
        let mut record = SandboxRecord {
            id,
            container_name: format!("openssh-server{suffix}"),
            sidecar_name: format!("capture{suffix}"),
            network_name: None,
            volume_name: format!("netlog{suffix}"),
            host_port: 0,
            state: TargetSystemState::Creating,
        };
        self.registry.insert(id, record.clone());

        match self.provision(&mut record, user, password).await {
            Ok(()) => {
                record.state = TargetSystemState::Ready;
                self.registry.insert(id, record.clone());
                Ok(record)
            }
            Err(err) => {
                tracing::warn!(sandbox_id = %id, error = %err, "acquire failed, tearing down partial resources");
                let _ = self.teardown(&record).await;
                self.registry.remove(&id);
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        record: &mut SandboxRecord,
        user: &str,
        password: &str,
    ) -> Result<(), SandboxError> {
        let network_mode = if self.config.enable_isolated_target_container_networks {
            let network_name = format!("sandbox-net-{:08x}", record.id.as_u32());
            self.docker
                .create_network(CreateNetworkOptions {
                    name: network_name.clone(),
                    ..Default::default()
                })
                .await?;
            record.network_name = Some(network_name.clone());
            Some(network_name)
        } else {
            None
        };

        self.docker
            .create_volume(CreateVolumeOptions {
                name: record.volume_name.clone(),
                ..Default::default()
            })
            .await?;

        let mut target_labels = HashMap::new();
        target_labels.insert(ROLE_LABEL.to_string(), ROLE_TARGET.to_string());
        target_labels.insert(SANDBOX_ID_LABEL.to_string(), format!("{:08x}", record.id.as_u32()));

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            "22/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: None,
            }]),
        );

        let target_config = Config {
            image: Some(TARGET_IMAGE.to_string()),
            env: Some(vec![
                format!("USER_NAME={user}"),
                format!("USER_PASSWORD={password}"),
                "PASSWORD_ACCESS=true".to_string(),
                "SUDO_ACCESS=false".to_string(),
            ]),
            exposed_ports: Some(HashMap::from([("22/tcp".to_string(), HashMap::new())])),
            labels: Some(target_labels),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: network_mode.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: record.container_name.clone(),
                    platform: None,
                }),
                target_config,
            )
            .await?;
        self.docker
            .start_container::<String>(&record.container_name, None)
            .await?;

        let mut capture_labels = HashMap::new();
        capture_labels.insert(ROLE_LABEL.to_string(), ROLE_CAPTURE.to_string());
        capture_labels.insert(SANDBOX_ID_LABEL.to_string(), format!("{:08x}", record.id.as_u32()));

        let capture_config = Config {
            image: Some(CAPTURE_IMAGE.to_string()),
            cmd: Some(vec![
                "tcpdump".to_string(),
                "-i".to_string(),
                "any".to_string(),
                "-w".to_string(),
                CAPTURE_PATH.to_string(),
            ]),
            labels: Some(capture_labels),
            host_config: Some(HostConfig {
                network_mode: Some(format!("container:{}", record.container_name)),
                binds: Some(vec![format!("{}:/netlog", record.volume_name)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: record.sidecar_name.clone(),
                    platform: None,
                }),
                capture_config,
            )
            .await?;
        self.docker
            .start_container::<String>(&record.sidecar_name, None)
            .await?;

        self.wait_until_ready(record.id, &record.container_name).await?;
        record.host_port = self.assigned_host_port(record.id, &record.container_name).await?;

        Ok(())
    }

    async fn wait_until_ready(&self, id: TargetSystemId, container_name: &str) -> Result<(), SandboxError> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        for _ in 0..READINESS_ATTEMPTS {
            let exec = self
                .docker
                .create_exec(
                    container_name,
                    CreateExecOptions {
                        cmd: Some(vec![
                            "s6-svstat".to_string(),
                            "-u".to_string(),
                            "/run/s6/services/openssh-server".to_string(),
                        ]),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await?;

            if let StartExecResults::Attached { mut output, .. } =
                self.docker.start_exec(&exec.id, None::<StartExecOptions>).await?
            {
                let mut collected = Vec::new();
                while let Some(Ok(chunk)) = output.next().await {
                    collected.extend_from_slice(&chunk.into_bytes());
                }
                if String::from_utf8_lossy(&collected).contains("up") {
                    return Ok(());
                }
            }

            tokio::time::sleep(backoff.next_delay()).await;
        }

        Err(SandboxError::ReadinessTimeout(id.as_u32()))
    }

    async fn assigned_host_port(&self, id: TargetSystemId, container_name: &str) -> Result<u32, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await?;

        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get("22/tcp").cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse().ok())
            .ok_or(SandboxError::ReadinessTimeout(id.as_u32()))
    }

    /// Stop the target and its capture sidecar, harvest the pcap, and tear
    /// down every resource belonging to this sandbox.
    pub async fn yield_target_system(&self, id: TargetSystemId) -> Result<Vec<DownloadEvent>, SandboxError> {
        let mut record = self
            .get(id)
            .ok_or(SandboxError::NotFound(id.as_u32()))?;
        record.state = TargetSystemState::Exiting;
        self.registry.insert(id, record.clone());

        let _ = self.docker.stop_container(&record.container_name, None).await;
        self.wait_until_exited(id, &record.container_name).await?;
        let _ = self.docker.stop_container(&record.sidecar_name, None).await;

        let archive = self.download_pcap_archive(&record.sidecar_name).await?;
        let pcap_bytes = crate::tar::extract_file(&archive, "netlog/log.pcap")
            .or_else(|| crate::tar::extract_file(&archive, "log.pcap"))
            .ok_or_else(|| SandboxError::PcapParse("log.pcap missing from harvested archive".to_string()))?;
        let events = crate::pcap::reconstruct_downloads(&pcap_bytes)?;

        self.teardown(&record).await?;
        self.registry.remove(&id);
        Ok(events)
    }

    async fn wait_until_exited(&self, id: TargetSystemId, container_name: &str) -> Result<(), SandboxError> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        for _ in 0..EXIT_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_container(container_name, None::<InspectContainerOptions>)
                .await?;
            let exited = inspect
                .state
                .and_then(|state| state.status)
                .map(|status| status == ContainerStateStatusEnum::EXITED)
                .unwrap_or(false);
            if exited {
                return Ok(());
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }

        Err(SandboxError::ExitTimeout(id.as_u32()))
    }

    async fn download_pcap_archive(&self, sidecar_name: &str) -> Result<Vec<u8>, SandboxError> {
        let mut stream = self.docker.download_from_container(
            sidecar_name,
            Some(DownloadFromContainerOptions {
                path: "/netlog".to_string(),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }

    async fn teardown(&self, record: &SandboxRecord) -> Result<(), SandboxError> {
        let remove_opts = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        let _ = self.docker.remove_container(&record.sidecar_name, remove_opts).await;
        let _ = self.docker.remove_container(&record.container_name, remove_opts).await;

        if let Some(network_name) = &record.network_name {
            let _ = self.docker.remove_network(network_name).await;
        }
        if !self.config.keep_target_system_volumes {
            let _ = self
                .docker
                .remove_volume(&record.volume_name, Some(RemoveVolumeOptions { force: true }))
                .await;
        }
        Ok(())
    }

    /// Force-remove every container this orchestrator has ever labeled,
    /// whether or not it is still tracked in the registry. Called once on
    /// shutdown so a crashed or leaked sandbox never outlives the process.
    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![ROLE_LABEL.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        for container in containers {
            if let Some(container_id) = container.id {
                let _ = self
                    .docker
                    .remove_container(
                        &container_id,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
        }

        self.registry.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_names_are_derived_from_id() {
        let id = TargetSystemId::new(0x1234abcd);
        let suffix = format!("{:08x}", id.as_u32());
        assert_eq!(format!("openssh-server{suffix}"), "openssh-server1234abcd");
        assert_eq!(format!("capture{suffix}"), "capture1234abcd");
    }
}
