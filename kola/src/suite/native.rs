//! Native functions run on the machines through `kolet`.

use anyhow::{ensure, Context};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use kola_platform::TestCluster;

use crate::error::RegistryError;
use crate::registry::{Registry, Test};

/// Line `Hello` prints on the machine.
pub const GREETING: &str = "hello from kolet";

/// Register `coretest.NativeHello`.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        Test::new("coretest.NativeHello", run)
            .cloud_config("#cloud-config\n")
            .native_func("Hello", hello),
    )
}

fn run(cluster: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    native_hello(cluster).boxed()
}

async fn native_hello(cluster: TestCluster) -> anyhow::Result<()> {
    for machine in cluster.machines().await {
        let out = cluster
            .run_native("Hello", machine.as_ref())
            .await
            .with_context(|| format!("running Hello on {}", machine.id()))?;
        let out = String::from_utf8_lossy(&out);
        ensure!(
            out.contains(GREETING),
            "unexpected output from {}: {}",
            machine.id(),
            out.trim()
        );
    }
    Ok(())
}

fn hello() -> anyhow::Result<()> {
    println!("{}", GREETING);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_is_registered_as_native() {
        let mut registry = Registry::new();
        register(&mut registry).unwrap();

        let test = registry.get("coretest.NativeHello").unwrap();
        assert!(test.has_native_funcs());
        assert!(test.platforms.is_none());
        assert!(registry.native_func("coretest.NativeHello", "Hello").unwrap()().is_ok());
    }
}
