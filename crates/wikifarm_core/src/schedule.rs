use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::backup::validate_label;
use crate::context::FarmContext;
use crate::error::FarmError;
use crate::process::{CommandRunner, CommandSpec, run_checked, shell_quote};

pub const MARKER_PREFIX: &str = "# wikifarm-backup:";

const CRON_MACROS: &[&str] = &[
    "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

/// A crontab entry owned by one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSchedule {
    pub installation: String,
    pub expression: String,
    pub command: String,
}

fn marker(installation_id: &str) -> String {
    format!("{MARKER_PREFIX}{installation_id}")
}

pub fn validate_cron_expression(expression: &str) -> Result<()> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        if CRON_MACROS.contains(&trimmed) {
            return Ok(());
        }
    } else {
        let fields = trimmed.split_whitespace().collect::<Vec<_>>();
        if fields.len() == 5
            && fields.iter().all(|field| {
                field
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '*' | '/' | ',' | '-'))
            })
        {
            return Ok(());
        }
    }
    Err(FarmError::ValidationFailed(format!(
        "'{expression}' is not a cron expression (five fields or a macro such as @daily)"
    ))
    .into())
}

fn read_crontab(runner: &dyn CommandRunner, binary: &str) -> Result<String> {
    let spec = CommandSpec::new(binary).arg("-l");
    let output = runner.run(&spec)?;
    if output.success() {
        return Ok(output.stdout);
    }
    // `crontab -l` exits 1 with "no crontab for <user>" when none exists.
    if output.stderr.to_ascii_lowercase().contains("no crontab") {
        return Ok(String::new());
    }
    Err(FarmError::CommandFailed {
        command: spec.display(),
        code: output.code,
        output: output.combined(),
    }
    .into())
}

fn write_crontab(runner: &dyn CommandRunner, binary: &str, content: &str) -> Result<()> {
    run_checked(runner, &CommandSpec::new(binary).arg("-").stdin(content))?;
    Ok(())
}

fn owned_by(line: &str, installation_id: &str) -> bool {
    line.trim_end().ends_with(&marker(installation_id))
}

fn parse_entry(line: &str, installation_id: &str) -> Option<BackupSchedule> {
    let body = line.trim_end().strip_suffix(&marker(installation_id))?.trim_end();
    let (expression, command) = if body.starts_with('@') {
        let (expression, command) = body.split_once(char::is_whitespace)?;
        (expression.to_string(), command.trim().to_string())
    } else {
        let mut rest = body;
        let mut fields = Vec::with_capacity(5);
        for _ in 0..5 {
            let trimmed = rest.trim_start();
            let end = trimmed.find(char::is_whitespace)?;
            fields.push(&trimmed[..end]);
            rest = &trimmed[end..];
        }
        (fields.join(" "), rest.trim().to_string())
    };
    Some(BackupSchedule {
        installation: installation_id.to_string(),
        expression,
        command,
    })
}

/// Installs (or replaces) the installation's scheduled backup. `executable` is
/// the wikifarm binary cron should run.
pub fn set_schedule(
    context: &FarmContext,
    expression: &str,
    label: &str,
    executable: &Path,
) -> Result<BackupSchedule> {
    validate_cron_expression(expression)?;
    validate_label(label)?;
    let installation = &context.installation;
    let binary = context.tool.crontab_binary();
    let runner = context.runner.as_ref();

    let log = installation.path.join(".backup").join("schedule.log");
    let command = format!(
        "{} --id {} backup create {} >> {} 2>&1",
        shell_quote(&executable.display().to_string()),
        shell_quote(&installation.id),
        shell_quote(label),
        shell_quote(&log.display().to_string()),
    );
    if command.contains('%') {
        return Err(FarmError::ValidationFailed(
            "paths containing '%' cannot be scheduled through cron".to_string(),
        )
        .into());
    }

    let current = read_crontab(runner, binary)?;
    let mut lines = current
        .lines()
        .filter(|line| !owned_by(line, &installation.id))
        .map(str::to_string)
        .collect::<Vec<_>>();
    lines.push(format!(
        "{} {command} {}",
        expression.trim(),
        marker(&installation.id)
    ));
    let mut rendered = lines.join("\n");
    rendered.push('\n');
    write_crontab(runner, binary, &rendered)?;
    info!(installation = %installation.id, expression, "backup schedule installed");

    Ok(BackupSchedule {
        installation: installation.id.clone(),
        expression: expression.trim().to_string(),
        command,
    })
}

pub fn list_schedules(context: &FarmContext) -> Result<Vec<BackupSchedule>> {
    let current = read_crontab(context.runner.as_ref(), context.tool.crontab_binary())?;
    Ok(current
        .lines()
        .filter(|line| owned_by(line, &context.installation.id))
        .filter_map(|line| parse_entry(line, &context.installation.id))
        .collect())
}

/// Removes the installation's schedule. Returns `false` when there was none.
pub fn remove_schedule(context: &FarmContext) -> Result<bool> {
    let binary = context.tool.crontab_binary();
    let runner = context.runner.as_ref();
    let current = read_crontab(runner, binary)?;
    let kept = current
        .lines()
        .filter(|line| !owned_by(line, &context.installation.id))
        .collect::<Vec<_>>();
    if kept.len() == current.lines().count() {
        return Ok(false);
    }
    let mut rendered = kept.join("\n");
    if !rendered.is_empty() {
        rendered.push('\n');
    }
    write_crontab(runner, binary, &rendered)?;
    info!(installation = %context.installation.id, "backup schedule removed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::rc::Rc;

    use tempfile::tempdir;

    use super::{list_schedules, remove_schedule, set_schedule, validate_cron_expression};
    use crate::context::FarmContext;
    use crate::error::FarmError;
    use crate::testing::{FakeOrchestrator, MockRunner, compose_installation, fake_context};

    fn context(root: &Path, runner: &Rc<MockRunner>) -> FarmContext {
        let installation = compose_installation(&root.join("farm"));
        let fake = Rc::new(FakeOrchestrator::new(&root.join("repo")));
        let mut context = fake_context(installation, fake);
        context.runner = runner.clone();
        context
    }

    fn written(runner: &MockRunner) -> String {
        runner
            .calls()
            .iter()
            .rev()
            .find(|call| call.args == ["-"])
            .and_then(|call| call.stdin.clone())
            .expect("crontab written")
    }

    #[test]
    fn cron_expressions() {
        assert!(validate_cron_expression("0 3 * * *").is_ok());
        assert!(validate_cron_expression("*/15 1-5 * * mon-fri").is_ok());
        assert!(validate_cron_expression("@daily").is_ok());
        assert!(validate_cron_expression("0 3 * *").is_err());
        assert!(validate_cron_expression("@sometimes").is_err());
        assert!(validate_cron_expression("0 3 * * *; rm -rf /").is_err());
    }

    #[test]
    fn set_replaces_own_entry_and_keeps_others() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        runner.respond(
            "crontab -l",
            0,
            "MAILTO=ops@example.org\n5 4 * * * /usr/bin/certbot renew\n0 1 * * * old # wikifarm-backup:farm\n",
            "",
        );
        let context = context(temp.path(), &runner);

        let schedule = set_schedule(&context, "0 3 * * *", "nightly", Path::new("/usr/local/bin/wikifarm"))
            .expect("set");
        assert!(schedule.command.starts_with("/usr/local/bin/wikifarm --id farm backup create nightly >> "));

        let crontab = written(&runner);
        let lines = crontab.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "MAILTO=ops@example.org");
        assert_eq!(lines[1], "5 4 * * * /usr/bin/certbot renew");
        assert!(lines[2].starts_with("0 3 * * * /usr/local/bin/wikifarm --id farm"));
        assert!(lines[2].ends_with("# wikifarm-backup:farm"));
    }

    #[test]
    fn set_works_without_existing_crontab() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        runner.respond("crontab -l", 1, "", "no crontab for wiki");
        let context = context(temp.path(), &runner);
        set_schedule(&context, "@daily", "daily", Path::new("/usr/bin/wikifarm")).expect("set");
        assert_eq!(written(&runner).lines().count(), 1);
    }

    #[test]
    fn invalid_label_is_rejected_before_touching_crontab() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        let context = context(temp.path(), &runner);
        let error = set_schedule(&context, "@daily", "bad label", Path::new("/usr/bin/wikifarm"))
            .expect_err("label");
        assert!(matches!(
            FarmError::find(&error),
            Some(FarmError::ValidationFailed(_))
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn list_and_remove_only_touch_own_entries() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        runner.respond(
            "crontab -l",
            0,
            "0 2 * * * /usr/bin/wikifarm --id other backup create x # wikifarm-backup:other\n30 3 * * 1 /usr/bin/wikifarm --id farm backup create weekly # wikifarm-backup:farm\n",
            "",
        );
        let context = context(temp.path(), &runner);

        let schedules = list_schedules(&context).expect("list");
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].expression, "30 3 * * 1");
        assert_eq!(
            schedules[0].command,
            "/usr/bin/wikifarm --id farm backup create weekly"
        );

        assert!(remove_schedule(&context).expect("remove"));
        assert_eq!(
            written(&runner),
            "0 2 * * * /usr/bin/wikifarm --id other backup create x # wikifarm-backup:other\n"
        );
    }

    #[test]
    fn remove_without_entry_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        runner.respond("crontab -l", 0, "5 4 * * * /usr/bin/certbot renew\n", "");
        let context = context(temp.path(), &runner);
        assert!(!remove_schedule(&context).expect("remove"));
        assert_eq!(runner.commands(), vec!["crontab -l"]);
    }
}
