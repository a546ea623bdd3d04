use crate::Probe;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sysinfo::{ProcessStatus, System};

pub struct LoadProbe;

#[derive(Debug, Clone, Serialize)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadMisc {
    pub procs_total: usize,
    pub procs_running: usize,
    pub procs_blocked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadInfo {
    pub average: LoadAverage,
    pub misc: LoadMisc,
    pub uptime_secs: u64,
}

impl LoadInfo {
    pub fn collect() -> Self {
        let avg = System::load_average();
        let system = System::new_all();

        Self {
            average: LoadAverage {
                load1: avg.one,
                load5: avg.five,
                load15: avg.fifteen,
            },
            misc: count_statuses(system.processes().values().map(|p| p.status())),
            uptime_secs: System::uptime(),
        }
    }
}

fn count_statuses(statuses: impl Iterator<Item = ProcessStatus>) -> LoadMisc {
    let mut misc = LoadMisc::default();
    for status in statuses {
        misc.procs_total += 1;
        match status {
            ProcessStatus::Run => misc.procs_running += 1,
            ProcessStatus::UninterruptibleDiskSleep => misc.procs_blocked += 1,
            _ => {}
        }
    }
    misc
}

impl Probe for LoadProbe {
    fn name(&self) -> &str {
        "load"
    }

    fn collect(&self) -> Result<Value> {
        Ok(serde_json::to_value(LoadInfo::collect())?)
    }
}
