use cv_domain::{Config, ConfigSeverity, ConversationMeta};
use cv_store::EventStore;

/// Runs all diagnostic checks and prints a summary. Returns `Ok(true)` when
/// every check passes.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("cv-gateway doctor");
    println!("=================\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_store_roundtrip(config, &mut all_passed);
    check_llm_provider(&mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({error_count} error(s))", issues.len()),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

/// Opens the configured SQLite file (creating it if absent), appends a
/// throwaway conversation, and reads it back — a trivial end-to-end proof
/// that the store is writable and readable before accepting real traffic.
fn check_store_roundtrip(config: &Config, all_passed: &mut bool) {
    let result = (|| -> cv_domain::Result<()> {
        let store = EventStore::open(&config.store.db_path)?;
        let conversation_id = store.create_conversation(&ConversationMeta {
            title: "doctor-probe".into(),
            scenario_id: None,
            agents: Vec::new(),
            starting_agent_id: None,
            config: Default::default(),
            custom: serde_json::Value::Null,
        })?;
        let snapshot = store.get_conversation_snapshot(conversation_id)?;
        if snapshot.events.is_empty() {
            return Err(cv_domain::Error::Fatal("probe conversation has no events".into()));
        }
        Ok(())
    })();

    match result {
        Ok(()) => print_check(
            "Event store round trip",
            true,
            config.store.db_path.display().to_string(),
        ),
        Err(e) => {
            print_check("Event store round trip", false, format!("{e}"));
            *all_passed = false;
        }
    }
}

fn check_llm_provider(all_passed: &mut bool) {
    let provider = std::env::var("CV_LLM_PROVIDER").unwrap_or_else(|_| "echo".into());
    print_check(
        "LLM provider configured",
        true,
        format!("{provider} (set CV_LLM_PROVIDER to override the zero-config echo default)"),
    );
    let _ = all_passed;
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
