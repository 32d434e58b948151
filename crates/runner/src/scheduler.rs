use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use broker::{Ledger, PaperBroker};
use common::{Interval, ProjectClaim, Result, RunStatus};
use marketdata::{KlineStore, SeriesCache, SeriesKey};
use ta::Indicators;

use crate::sandbox;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub claim_batch: i32,
    pub vm_timeout: Duration,
    pub exchange: String,
    pub max_candles: usize,
}

/// Claims due projects and runs each one's strategy, one project at a
/// time. Claims are mutually exclusive across runner processes — the
/// database RPC marks a project before handing it out — so several
/// schedulers can share a deployment without double-running anything.
pub struct Scheduler {
    pool: PgPool,
    store: Arc<dyn KlineStore>,
    ledger: Arc<dyn Ledger>,
    cache: SeriesCache,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        store: Arc<dyn KlineStore>,
        ledger: Arc<dyn Ledger>,
        cache: SeriesCache,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            store,
            ledger,
            cache,
            config,
        }
    }

    /// Run the claim loop forever. Call from `tokio::spawn`. A failed
    /// claim or a failed project only costs this tick; the loop goes on.
    pub async fn run(self) {
        info!(every = ?self.config.tick, "Scheduler running");
        loop {
            match self.claim_due().await {
                Ok(claims) => {
                    for claim in claims {
                        if let Err(e) = self.process(&claim).await {
                            error!(project = %claim.id, error = %e, "Project run bookkeeping failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "Claiming due projects failed"),
            }
            tokio::time::sleep(self.config.tick).await;
        }
    }

    async fn claim_due(&self) -> Result<Vec<ProjectClaim>> {
        let claims: Vec<ProjectClaim> = sqlx::query_as(
            "SELECT id, owner_id, generated_js, interval_seconds FROM claim_due_projects($1)",
        )
        .bind(self.config.claim_batch)
        .fetch_all(&self.pool)
        .await?;
        if !claims.is_empty() {
            info!(count = claims.len(), "Claimed due projects");
        }
        Ok(claims)
    }

    /// One full run cycle for a claimed project: create the run record,
    /// execute per symbol, finish the run in a terminal state. User-code
    /// failures land in the run record; only bookkeeping failures
    /// propagate to the caller.
    async fn process(&self, claim: &ProjectClaim) -> Result<()> {
        let run_id = self.insert_run(claim).await?;

        if claim.generated_js.trim().is_empty() {
            warn!(project = %claim.id, "Empty strategy source, skipping run");
            self.finish_run(run_id, RunStatus::Skipped, Some("empty strategy source"), None)
                .await?;
            self.update_project(claim.id, RunStatus::Skipped, None).await?;
            return Ok(());
        }

        let symbols = self.project_symbols(claim.id).await?;
        let timeframes = required_timeframes(&claim.generated_js);

        let outcome = self.run_symbols(claim, &symbols, &timeframes).await;
        if outcome.failures.is_empty() {
            let summary = format!("ran {} symbol(s)", outcome.ran);
            self.finish_run(run_id, RunStatus::Ok, Some(&summary), None).await?;
            self.update_project(claim.id, RunStatus::Ok, None).await?;
        } else {
            let message = outcome.failures.join("; ");
            warn!(project = %claim.id, error = %message, "Strategy run failed");
            self.finish_run(run_id, RunStatus::Error, None, Some(&message)).await?;
            self.update_project(claim.id, RunStatus::Error, Some(&message)).await?;
        }
        Ok(())
    }

    /// Execute the strategy once per symbol. A symbol whose series cannot
    /// be preloaded is skipped with a warning, and a strategy error is
    /// recorded against its symbol only — the remaining symbols still get
    /// their turn. The run's terminal status is decided by the caller from
    /// the accumulated outcome.
    async fn run_symbols(
        &self,
        claim: &ProjectClaim,
        symbols: &[String],
        timeframes: &[Interval],
    ) -> SymbolOutcome {
        let mut outcome = SymbolOutcome::default();
        'symbols: for symbol in symbols {
            let symbol = symbol.trim().to_uppercase();
            if symbol.is_empty() {
                continue;
            }

            for tf in timeframes {
                let key = SeriesKey::new(self.config.exchange.clone(), symbol.clone(), *tf);
                if let Err(e) = self
                    .cache
                    .preload(self.store.as_ref(), &key, Some(self.config.max_candles))
                    .await
                {
                    warn!(series = %key, error = %e, "Series preload failed, skipping symbol");
                    continue 'symbols;
                }
            }

            let indicators = Arc::new(Indicators::new(
                self.cache.clone(),
                self.config.exchange.clone(),
                symbol.clone(),
                Interval::M1,
            ));
            let hp = Arc::new(PaperBroker::new(
                self.ledger.clone(),
                self.cache.clone(),
                self.config.exchange.clone(),
                symbol.clone(),
                claim.id,
                claim.owner_id,
            ));

            match sandbox::execute(
                claim.generated_js.clone(),
                indicators,
                hp,
                self.config.vm_timeout,
            )
            .await
            {
                Ok(()) => outcome.ran += 1,
                Err(e) => {
                    warn!(project = %claim.id, symbol = %symbol, error = %e, "Strategy failed on symbol");
                    outcome.failures.push(format!("{symbol}: {e}"));
                }
            }
        }
        outcome
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────

    async fn insert_run(&self, claim: &ProjectClaim) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO project_runs (id, project_id, user_id, mode, status)
             VALUES ($1, $2, $3, 'paper', 'running')",
        )
        .bind(run_id)
        .bind(claim.id)
        .bind(claim.owner_id)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE project_runs
             SET status = $2, finished_at = now(), summary = $3, error = $4
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(summary)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_project(
        &self,
        project_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET last_run_status = $2, last_run_error = $3 WHERE id = $1",
        )
        .bind(project_id)
        .bind(status.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn project_symbols(&self, project_id: Uuid) -> Result<Vec<String>> {
        let symbols: Option<Vec<String>> =
            sqlx::query_scalar("SELECT symbols FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(symbols.unwrap_or_default())
    }
}

/// What happened across one run's symbols: how many executed cleanly,
/// and one message per symbol whose strategy failed.
#[derive(Debug, Default)]
struct SymbolOutcome {
    ran: usize,
    failures: Vec<String>,
}

/// Conservative scan of the strategy source for `tf: "<interval>"`
/// literals. Every interval mentioned that way gets preloaded; a source
/// that names none gets the 1m default.
pub fn required_timeframes(source: &str) -> Vec<Interval> {
    let mut out: Vec<Interval> = Vec::new();
    let bytes = source.as_bytes();
    let mut offset = 0;

    while let Some(found) = source[offset..].find("tf") {
        let at = offset + found;
        offset = at + 2;

        if at > 0 {
            let prev = bytes[at - 1];
            if prev.is_ascii_alphanumeric() || prev == b'_' {
                continue;
            }
        }

        let rest = source[at + 2..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else { continue };
        let rest = rest.trim_start();
        let Some(quote) = rest.chars().next().filter(|q| *q == '"' || *q == '\'') else {
            continue;
        };
        let rest = &rest[1..];
        let Some(end) = rest.find(quote) else { continue };

        if let Some(interval) = Interval::parse(&rest[..end]) {
            if !out.contains(&interval) {
                out.push(interval);
            }
        }
    }

    if out.is_empty() {
        out.push(Interval::M1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::MemLedger;
    use marketdata::MemKlineStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn symbol_failures_do_not_abort_sibling_symbols() {
        // The pool is never touched by run_symbols; connect_lazy does no I/O.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let ledger = Arc::new(MemLedger::new());
        let scheduler = Scheduler::new(
            pool,
            Arc::new(MemKlineStore::new()),
            ledger.clone(),
            SeriesCache::new(100),
            SchedulerConfig {
                tick: Duration::from_secs(2),
                claim_batch: 5,
                vm_timeout: Duration::from_secs(5),
                exchange: "binance".into(),
                max_candles: 500,
            },
        );
        let claim = ProjectClaim {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            generated_js: r#"
                if context.symbol == "AAAUSDT" { throw "bad symbol"; }
                HP.log("info", "ok");
            "#
            .to_string(),
            interval_seconds: 60,
        };
        let symbols = vec!["AAAUSDT".to_string(), "BBBUSDT".to_string()];

        let outcome = scheduler
            .run_symbols(&claim, &symbols, &[Interval::M1])
            .await;

        // The first symbol's throw is recorded, the second still ran.
        assert_eq!(outcome.ran, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].contains("AAAUSDT"));
        assert_eq!(ledger.logs().len(), 1);
        assert_eq!(ledger.logs()[0].message, "ok");
    }

    #[test]
    fn defaults_to_one_minute() {
        assert_eq!(required_timeframes("HP.buy(100)"), vec![Interval::M1]);
        assert_eq!(required_timeframes(""), vec![Interval::M1]);
    }

    #[test]
    fn finds_quoted_tf_literals() {
        let source = r#"
            let a = EMA(#{ tf: "5m", length: 20 });
            let b = RSI(#{ tf: "1h", period: 14 });
            let c = SMA(#{ tf: "5m", length: 50 });
        "#;
        assert_eq!(
            required_timeframes(source),
            vec![Interval::M5, Interval::H1]
        );
    }

    #[test]
    fn accepts_single_quotes_and_loose_spacing() {
        assert_eq!(required_timeframes("tf : '15m'"), vec![Interval::M15]);
        assert_eq!(required_timeframes("tf:\"4h\""), vec![Interval::H4]);
    }

    #[test]
    fn ignores_lookalikes() {
        // `setf`, `tfoo` and unknown intervals must not register.
        assert_eq!(required_timeframes("setf: '5m'"), vec![Interval::M1]);
        assert_eq!(required_timeframes("tfoo: '5m'"), vec![Interval::M1]);
        assert_eq!(required_timeframes("tf: '7m'"), vec![Interval::M1]);
        assert_eq!(required_timeframes("tf = '5m'"), vec![Interval::M1]);
    }
}
