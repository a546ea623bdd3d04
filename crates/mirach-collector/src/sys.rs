use crate::Probe;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sysinfo::System;

/// Mostly static machine facts; worth checking more than once, but rarely.
pub struct SysProbe;

#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub boot_time: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub core: usize,
    pub name: String,
    pub vendor_id: String,
    pub brand: String,
    pub frequency_mhz: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SysInfo {
    pub host: HostInfo,
    pub cpus: Vec<CpuInfo>,
}

impl SysInfo {
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();

        let cpus = system
            .cpus()
            .iter()
            .enumerate()
            .map(|(i, cpu)| CpuInfo {
                core: i,
                name: cpu.name().to_string(),
                vendor_id: cpu.vendor_id().to_string(),
                brand: cpu.brand().to_string(),
                frequency_mhz: cpu.frequency(),
            })
            .collect();

        Self {
            host: HostInfo {
                hostname: System::host_name(),
                os: System::name(),
                os_version: System::os_version(),
                kernel_version: System::kernel_version(),
                arch: std::env::consts::ARCH.to_string(),
                boot_time: System::boot_time(),
                uptime_secs: System::uptime(),
            },
            cpus,
        }
    }
}

impl Probe for SysProbe {
    fn name(&self) -> &str {
        "sys"
    }

    fn collect(&self) -> Result<Value> {
        Ok(serde_json::to_value(SysInfo::collect())?)
    }
}
