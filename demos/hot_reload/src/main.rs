//! Hot Reload Example
//!
//! Walks a small plugin set through its lifecycle:
//!
//! ```text
//! base            statically linked, owns the "ready" handler
//! └── greeter     declares `base` as a dependency, adds "message" + /greet
//! extras.*        a package loaded through a wildcard
//!     └── extras.dice   imports `base` at load time
//! ```
//!
//! 1. autoload through [`ScionRuntime`]
//! 2. edit `greeter` and reload it
//! 3. break `greeter` and watch the reload keep the old version
//! 4. delete `extras.dice` and watch `reload_all` unlink it
//! 5. stop, which rolls back everything
//!
//! # Usage
//!
//! ```bash
//! cargo run --package hot-reload
//! ```

use anyhow::Result;
use linkme::distributed_slice;
use scion::loader::{STATIC_MODULES, StaticModule};
use scion::prelude::*;
use scion::runtime::PluginSettings;
use serde_json::{Value, json};
use tracing::{info, warn};

// ============================================================================
// Plugin bodies
// ============================================================================

async fn on_ready(_: Event) {
    info!("[base] ready");
}

fn base(scope: &mut ModuleScope<'_>) -> BodyResult {
    scope.on_event("ready", on_ready)?;
    Ok(())
}

#[distributed_slice(STATIC_MODULES)]
static BASE: StaticModule = StaticModule {
    name: "base",
    is_package: false,
    body: base,
};

fn greeting(scope: &ModuleScope<'_>) -> String {
    scope
        .variable::<Value>("greeting")
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "hello".to_string())
}

fn greeter_v1(scope: &mut ModuleScope<'_>) -> BodyResult {
    let greeting = greeting(scope);
    scope.on_event("message", |event: Event| async move {
        info!(text = ?event.str_field("text"), "[greeter v1] message");
    })?;
    scope.command("greet", "Greets someone", move |args: Vec<String>| {
        let reply = format!("{greeting}, {}!", args.join(" "));
        async move { reply }
    })?;
    scope.set_hook("setup", Hook::sync(|module| {
        info!(plugin = %module.name(), "[greeter v1] set up");
        Ok(())
    }))?;
    Ok(())
}

fn greeter_v2(scope: &mut ModuleScope<'_>) -> BodyResult {
    let greeting = greeting(scope).to_uppercase();
    scope.on_event("message", |event: Event| async move {
        info!(text = ?event.str_field("text"), "[greeter v2] message");
    })?;
    scope.command("greet", "Greets someone loudly", move |args: Vec<String>| {
        let reply = format!("{greeting}, {}!!", args.join(" ").to_uppercase());
        async move { reply }
    })?;
    Ok(())
}

fn dice(scope: &mut ModuleScope<'_>) -> BodyResult {
    scope.import("base")?;
    scope.command("roll", "Rolls a die", |_: Vec<String>| async { "4".to_string() })?;
    Ok(())
}

// ============================================================================
// Walkthrough
// ============================================================================

async fn show(runtime: &ScionRuntime, step: &str) {
    let client = runtime.client();
    let handled = client
        .events()
        .dispatch(&Event::new("message").with_payload(json!({ "text": step })))
        .await;
    let reply = client
        .commands()
        .invoke("greet", vec!["world".to_string()])
        .await
        .unwrap_or_else(|e| e.to_string());
    let loaded: Vec<String> = runtime
        .loader()
        .plugins()
        .iter()
        .filter(|plugin| plugin.is_loaded())
        .map(|plugin| plugin.name().to_string())
        .collect();
    info!(step, handled, %reply, ?loaded, commands = client.commands().len(), "State");
}

#[tokio::main]
async fn main() -> Result<()> {
    let catalog = Arc::new(ModuleCatalog::new().with_static_modules());
    catalog.insert("greeter", greeter_v1);
    catalog.insert_package("extras", |_| Ok(()));
    catalog.insert("extras.dice", dice);

    let mut config = ScionConfig::default();
    config.loader.autoload = vec!["greeter".into(), "extras".into(), "extras.*".into()];
    config
        .loader
        .default_variables
        .insert("greeting".into(), json!("hello"));
    config.plugins.insert(
        "greeter".into(),
        PluginSettings {
            requires: vec!["base".into()],
            ..Default::default()
        },
    );

    let runtime = ScionRuntime::with_catalog(&config, catalog.clone())?;
    runtime.start().await?;
    runtime.client().events().dispatch(&Event::new("ready")).await;
    show(&runtime, "after autoload").await;

    // 2. edit and reload
    catalog.replace("greeter", greeter_v2);
    runtime.loader().reload("greeter").await?;
    show(&runtime, "after edit").await;

    // 3. a broken edit keeps the running version
    catalog.break_source("greeter", "expected `;`");
    if let Err(e) = runtime.loader().reload("greeter").await {
        warn!(error = %e, "Reload rejected");
    }
    show(&runtime, "after broken edit").await;
    catalog.replace("greeter", greeter_v2);

    // 4. deleted sources are unlinked
    catalog.remove("extras.dice");
    runtime.loader().reload_all().await?;
    info!(
        dice_registered = runtime.loader().get_plugin("extras.dice").is_some(),
        "After deleting extras.dice"
    );
    show(&runtime, "after delete").await;

    // 5. stop rolls everything back
    runtime.stop().await?;
    show(&runtime, "after stop").await;
    Ok(())
}
