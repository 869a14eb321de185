use anyhow::Result;
use serde_json::{Map, Value};

use crate::args::BaseArgs;

type Fields = Vec<(&'static str, Value)>;

pub fn run(base: BaseArgs, global: bool, local: bool, verbose: bool) -> Result<()> {
    if verbose {
        run_verbose(base, global, local)
    } else {
        run_resolved(base, global, local)
    }
}

fn run_resolved(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let config = if global {
        super::load_global()?
    } else if local {
        super::local_path()
            .map(|p| super::load_file(&p))
            .unwrap_or_default()
    } else {
        super::load()?
    };

    let output = format_resolved(&config.non_empty_fields(), base.json)?;
    if !output.is_empty() {
        if base.json {
            // JSON goes to stdout so it can be piped
            println!("{output}");
        } else {
            eprintln!("{output}");
        }
    }

    Ok(())
}

fn format_resolved(fields: &Fields, json: bool) -> Result<String> {
    if json {
        let map: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Ok(serde_json::to_string(&map)?)
    } else {
        Ok(fields
            .iter()
            .map(|(k, v)| format!("{k}: {}", super::display_value(v)))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

fn run_verbose(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let global_path = super::global_path().ok();
    let local_path = super::local_path();

    let global_cfg = if !local {
        global_path
            .as_ref()
            .map(|p| (p.display().to_string(), super::load_file(p)))
    } else {
        None
    };

    let local_cfg = if !global {
        local_path.as_ref().map(|p| {
            let display_path = std::env::current_dir()
                .ok()
                .and_then(|cwd| pathdiff::diff_paths(p, &cwd))
                .unwrap_or_else(|| p.clone())
                .display()
                .to_string();
            (display_path, super::load_file(p))
        })
    } else {
        None
    };

    let mut sources: Vec<(String, Fields)> = Vec::new();
    for (path, cfg) in [global_cfg, local_cfg].into_iter().flatten() {
        let fields = cfg.non_empty_fields();
        if !fields.is_empty() {
            sources.push((path, fields));
        }
    }

    let output = format_verbose(&sources, base.json)?;
    if !output.is_empty() {
        println!("{output}");
    }

    Ok(())
}

fn format_verbose(sources: &[(String, Fields)], json: bool) -> Result<String> {
    if json {
        let mut map = Map::new();
        for (path, fields) in sources {
            let o: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            map.insert(path.clone(), Value::Object(o));
        }
        Ok(serde_json::to_string(&map)?)
    } else {
        let mut parts = Vec::new();
        for (path, fields) in sources {
            let mut group = String::from(path.as_str());
            for (key, value) in fields {
                group.push_str(&format!("\n  {key}: {}", super::display_value(value)));
            }
            parts.push(group);
        }
        Ok(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn connection(url: &str, workers: usize) -> Config {
        Config {
            url: Some(url.into()),
            workers: Some(workers),
            ..Default::default()
        }
    }

    #[test]
    fn resolved_text_lists_in_key_order() {
        let config = connection("https://erp.example.com", 4);
        let out = format_resolved(&config.non_empty_fields(), false).unwrap();
        assert_eq!(out, "url: https://erp.example.com\nworkers: 4");
    }

    #[test]
    fn resolved_text_empty_config() {
        let out = format_resolved(&Config::default().non_empty_fields(), false).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn resolved_json_keeps_numbers() {
        let config = connection("https://erp.example.com", 4);
        let out = format_resolved(&config.non_empty_fields(), true).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["url"], "https://erp.example.com");
        assert_eq!(parsed["workers"], 4);
    }

    #[test]
    fn verbose_text_groups_by_source() {
        let sources: Vec<(String, Fields)> = vec![
            (
                "~/.config/odf/config.json".into(),
                vec![("url", Value::from("https://erp.example.com"))],
            ),
            (".odf/config.json".into(), vec![("batch_size", Value::from(250))]),
        ];
        let out = format_verbose(&sources, false).unwrap();
        assert_eq!(
            out,
            "~/.config/odf/config.json\n  url: https://erp.example.com\n\n.odf/config.json\n  batch_size: 250"
        );
    }

    #[test]
    fn verbose_json_nested_by_path() {
        let sources: Vec<(String, Fields)> = vec![(
            ".odf/config.json".into(),
            vec![("database", Value::from("prod"))],
        )];
        let out = format_verbose(&sources, true).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[".odf/config.json"]["database"], "prod");
        assert_eq!(format_verbose(&[], true).unwrap(), "{}");
    }
}
