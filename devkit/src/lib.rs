/*!
# Twin DevKit - test doubles for the sync agents

Lets the coordinator and probe tests run without a broker, routers or hosts:
- Recording health-event bus
- Scripted IOS router speaking the interactive CLI
- iptables emulator behind the remote-exec seam
- Recording enforcement/power backends, scripted reachability and checks
- Sample topology
*/

pub mod fixtures;
pub mod ios_sim;
pub mod iptables_sim;
pub mod mqtt_stub;
pub mod test_utils;

pub use ios_sim::ScriptedIosDevice;
pub use iptables_sim::FakeIptables;
pub use mqtt_stub::MockBus;
pub use test_utils::init_test_logging;
