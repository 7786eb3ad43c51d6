use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

/// Shared convention for where a project's working tree lives on disk,
/// so the Git polling handler (C5) and the pipeline's discovery stage (C6
/// P1) agree on a path without either depending on the other.
pub fn project_repo_dir(data_dir: &str, project_id: i64) -> String {
    format!("{data_dir}/repos/{project_id}")
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// One row of `git log --pretty=format:%H|%an|%aI|%s`.
#[derive(Debug, Clone)]
pub struct CommitLine {
    pub hash: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub subject: String,
}

/// Thin wrapper over the `git` CLI for the Git source handler (C5): clone,
/// fetch, default-branch detection and commit listing. Every invocation runs
/// with `GIT_TERMINAL_PROMPT=0` so a missing/expired credential fails fast
/// with a readable message instead of hanging on a prompt.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(dir, args, &[])
    }

    pub fn exec_env(&self, dir: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Writes a POSIX-0700 credential-helper script under `repo_path/.git`
    /// that hands the username/token back to git over stdout, then returns
    /// the `core.credentialHelper` value to pass on the command line. Avoids
    /// ever putting the token in argv or in a URL that ends up in a log line
    /// (§6 outbound Git CLI contract).
    pub fn write_credential_helper(repo_path: &str, username: &str, token: &str) -> Result<String> {
        let git_dir = Path::new(repo_path).join(".git");
        fs::create_dir_all(&git_dir).context("create .git dir for credential helper")?;
        let helper_path = git_dir.join("credential-helper.sh");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"get\" ]; then\n  echo \"username={username}\"\n  echo \"password={token}\"\nfi\n"
        );
        fs::write(&helper_path, script).context("write credential-helper.sh")?;
        let mut perms = fs::metadata(&helper_path)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&helper_path, perms).context("chmod credential-helper.sh")?;
        Ok(helper_path.to_string_lossy().into_owned())
    }

    /// Shallow-clones `url` into `self.repo_path` (depth 50) if it does not
    /// already contain a `.git` directory; otherwise a no-op so repeated
    /// poll cycles are cheap.
    pub fn clone_shallow(&self, url: &str, helper_path: Option<&str>) -> Result<()> {
        if Path::new(&self.repo_path).join(".git").exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.repo_path).context("create clone target dir")?;
        let parent = Path::new(&self.repo_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let helper_config = helper_path.map(|helper| format!("credential.helper={helper}"));
        let mut args: Vec<&str> = vec!["clone", "--depth", "50"];
        if let Some(helper_config) = &helper_config {
            args.push("--config");
            args.push("credential.helper=");
            args.push("--config");
            args.push(helper_config);
        }
        args.push(url);
        args.push(&self.repo_path);
        let result = self.exec(&parent, &args)?;
        if !result.success() {
            return Err(anyhow!("git clone {url} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    /// `fetch --all --prune`, the steady-state update for an already-cloned
    /// working tree.
    pub fn fetch_all_prune(&self) -> Result<()> {
        let result = self.exec(&self.repo_path, &["fetch", "--all", "--prune"])?;
        if !result.success() {
            return Err(anyhow!("git fetch --all --prune failed: {}", result.combined_output()));
        }
        Ok(())
    }

    /// Resolves the remote default branch from `refs/remotes/origin/HEAD`,
    /// falling back to `main` then `master` if the symbolic ref was never
    /// set up locally (common for a bare `--depth` clone).
    pub fn default_branch(&self) -> Result<String> {
        let result = self.exec(
            &self.repo_path,
            &["symbolic-ref", "refs/remotes/origin/HEAD"],
        )?;
        if result.success() {
            if let Some(name) = result.stdout.trim().strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            let check = self.exec(
                &self.repo_path,
                &["rev-parse", "--verify", &format!("origin/{candidate}")],
            )?;
            if check.success() {
                return Ok(candidate.to_string());
            }
        }
        Err(anyhow!("could not determine default branch for {}", self.repo_path))
    }

    /// Commit log on `branch`, optionally bounded to commits authored after
    /// `since`, newest first, parsed from `%H|%an|%aI|%s`.
    pub fn commit_log(&self, branch: &str, since: Option<DateTime<Utc>>) -> Result<Vec<CommitLine>> {
        let range = format!("origin/{branch}");
        let mut args = vec!["log", "--pretty=format:%H|%an|%aI|%s", range.as_str()];
        let since_arg;
        if let Some(since) = since {
            since_arg = format!("--since={}", since.to_rfc3339());
            args.insert(1, &since_arg);
        }
        let result = self.exec(&self.repo_path, &args)?;
        if !result.success() {
            return Err(anyhow!("git log failed on {branch}: {}", result.combined_output()));
        }
        let mut commits = Vec::new();
        for line in result.stdout.lines() {
            let mut parts = line.splitn(4, '|');
            let (Some(hash), Some(author), Some(date), Some(subject)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(date) = DateTime::parse_from_rfc3339(date) else {
                continue;
            };
            commits.push(CommitLine {
                hash: hash.to_string(),
                author: author.to_string(),
                date: date.with_timezone(&Utc),
                subject: subject.to_string(),
            });
        }
        Ok(commits)
    }

    pub fn rev_parse_head(&self, branch: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", &format!("origin/{branch}")])?;
        if !result.success() {
            return Err(anyhow!("git rev-parse origin/{branch} failed: {}", result.combined_output()));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn ls_files(&self, branch: &str) -> Result<Vec<String>> {
        let result = self.exec(&self.repo_path, &["ls-tree", "-r", "--name-only", &format!("origin/{branch}")])?;
        if !result.success() {
            return Err(anyhow!("git ls-tree failed on {branch}: {}", result.combined_output()));
        }
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    pub fn show_file(&self, branch: &str, path: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["show", &format!("origin/{branch}:{path}")])?;
        if !result.success() {
            return Err(anyhow!("git show {branch}:{path} failed: {}", result.combined_output()));
        }
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> Git {
        let git = Git::new(dir.to_string_lossy().into_owned());
        git.exec(&git.repo_path, &["init", "-q"]).unwrap();
        git.exec(&git.repo_path, &["config", "user.email", "a@b.com"]).unwrap();
        git.exec(&git.repo_path, &["config", "user.name", "A"]).unwrap();
        git
    }

    #[test]
    fn credential_helper_script_is_mode_0700() {
        let dir = tempdir().unwrap();
        let path = Git::write_credential_helper(&dir.path().to_string_lossy(), "bot", "s3cr3t").unwrap();
        let perms = fs::metadata(&path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("username=bot"));
        assert!(contents.contains("password=s3cr3t"));
    }

    #[test]
    fn commit_log_parses_pipe_delimited_lines() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());
        fs::write(dir.path().join("f.txt"), "hi").unwrap();
        git.exec(&git.repo_path, &["add", "-A"]).unwrap();
        git.exec(&git.repo_path, &["commit", "-q", "-m", "initial commit"]).unwrap();

        // Simulate an "origin" remote pointing at the same repo so
        // origin/<branch> resolves for the read-only query helpers.
        git.exec(&git.repo_path, &["remote", "add", "origin", &git.repo_path]).unwrap();
        git.exec(&git.repo_path, &["fetch", "origin"]).unwrap();

        let branch = git.exec(&git.repo_path, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap().stdout.trim().to_string();
        let commits = git.commit_log(&branch, None).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "initial commit");
        assert_eq!(commits[0].author, "A");
    }
}
