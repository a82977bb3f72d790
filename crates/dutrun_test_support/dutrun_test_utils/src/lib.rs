//! Stand-ins for the DUT side of a run: simulated test bundles, a fixture service and a
//! connection manager that never leave this machine.

pub mod bundle_sim;
pub mod fakes;

use dutrun_protocol::{BundleEntity, Entity};

pub use bundle_sim::{SimBundle, SimLauncher, SimTest};
pub use fakes::{CountingConnectionManager, FakeFixtureService, RecordingReportClient};

/// A test of a bundle on the DUT.
pub fn local_test(bundle: &str, name: &str, fixture: &str) -> BundleEntity {
    BundleEntity {
        bundle: bundle.to_string(),
        hops: 1,
        entity: Entity::test(name, bundle, fixture),
    }
}

/// A fixture of a bundle on the DUT.
pub fn local_fixture(bundle: &str, name: &str, parent: &str) -> BundleEntity {
    BundleEntity {
        bundle: bundle.to_string(),
        hops: 1,
        entity: Entity::fixture(name, bundle, parent),
    }
}

/// A fixture of a bundle running on the orchestrator's host.
pub fn remote_fixture(bundle: &str, name: &str) -> BundleEntity {
    BundleEntity {
        bundle: bundle.to_string(),
        hops: 0,
        entity: Entity::fixture(name, bundle, ""),
    }
}
