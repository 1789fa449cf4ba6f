/*!
# linupdate DevKit - test doubles for the reposerver agent

Lets the control agent run without a fleet server or a real package manager:
- Mock outbound channel with connect / disconnect and ledger snapshots
- Mock package manager and status reporter recording every call
- Builders for the inbound JSON messages sent by the fleet server
- A `TestHarness` wiring a `ControlAgent` to temporary directories
*/

pub mod messages;
pub mod mock_channel;
pub mod mock_packages;
pub mod test_utils;

pub use mock_channel::MockOutbox;
pub use mock_packages::{MockPackageManager, MockReporter};
pub use test_utils::TestHarness;
