use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};

/// A tree of named, timed stages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TimingLog {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub children: Vec<Stage>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }
}

impl Stage {
    pub fn start(name: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start,
            end: None,
            children: vec![],
        }
    }

    pub fn finish(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
    }

    /// Adopts the top-level stages of another log as children of this stage.
    pub fn import(&mut self, log: TimingLog) {
        self.children.extend(log.stages);
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end - self.start)
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Stage, TimingLog};

    #[test]
    fn imported_stages_become_children() {
        let start = Utc.with_ymd_and_hms(2023, 4, 1, 10, 0, 0).unwrap();
        let mut stage = Stage::start("pkg.Test", start);

        let mut sub = TimingLog::new();
        sub.push(Stage::start("setup", start));
        stage.import(sub);
        stage.finish(start + Duration::seconds(3));

        assert_eq!(stage.children.len(), 1);
        assert_eq!(stage.children[0].name, "setup");
        assert_eq!(stage.duration(), Some(Duration::seconds(3)));
    }
}
