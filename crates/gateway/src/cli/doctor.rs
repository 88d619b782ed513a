use jarvis_domain::config::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("jarvis doctor");
    println!("=============\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_ollama_reachable(config, &mut all_passed).await;
    check_llm_providers(config, &mut all_passed);
    check_mcp_servers(config, &mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

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
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

async fn check_ollama_reachable(config: &Config, all_passed: &mut bool) {
    let url = &config.orchestrator.ollama_base;
    let tags_url = format!("{}/api/tags", url.trim_end_matches('/'));
    let reachable = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client.get(&tags_url).send().await.is_ok(),
        Err(_) => false,
    };

    print_check(
        "Ollama model runtime reachable",
        reachable,
        if reachable {
            url.clone()
        } else {
            format!("{url} (unreachable)")
        },
    );

    if !reachable {
        *all_passed = false;
    }
}

fn check_llm_providers(config: &Config, all_passed: &mut bool) {
    let count = config.llm.providers.len();
    let ok = count > 0;

    print_check(
        "LLM providers configured",
        ok,
        if ok {
            format!("{count} provider(s)")
        } else {
            "none configured".into()
        },
    );

    if !ok {
        *all_passed = false;
    }
}

fn check_mcp_servers(config: &Config, _all_passed: &mut bool) {
    let count = config.mcp.effective_servers().len();
    print_check(
        "MCP servers configured",
        true,
        if count == 0 {
            "none (fast-lane tools only)".into()
        } else {
            format!("{count} server(s)")
        },
    );
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_mcp_servers_passes_with_none_configured() {
        let config = Config::default();
        let mut all_passed = true;
        check_mcp_servers(&config, &mut all_passed);
        assert!(all_passed);
    }

    #[test]
    fn check_llm_providers_fails_with_none_configured() {
        let config = Config::default();
        let mut all_passed = true;
        check_llm_providers(&config, &mut all_passed);
        assert!(!all_passed);
    }

    #[tokio::test]
    async fn check_ollama_reachable_fails_against_unroutable_address() {
        let mut config = Config::default();
        config.orchestrator.ollama_base = "http://127.0.0.1:1".into();
        let mut all_passed = true;
        check_ollama_reachable(&config, &mut all_passed).await;
        assert!(!all_passed);
    }
}
