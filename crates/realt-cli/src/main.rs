use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use realt_data::invoices::import_invoices;
use realt_data::ledger::{LedgerClient, DEFAULT_API_URL};
use realt_data::store::Store;
use realt_data::{Purchase, Sale};
use realt_recon::pipeline::{match_purchases, match_sales, purchases_by_source, sale_totals};
use realt_recon::{AllocationOrder, EngineConfig, PurchaseReport, SaleReport, SkipCounters};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    wallet: Option<String>,
    old_wallet: Option<String>,
    allocation_order: String,
}

#[derive(Parser, Debug)]
#[command(name = "realt-ledger")]
#[command(about = "Reconcile RealToken invoices, transfers and sales into a ROI ledger")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, env = "REALT_DB_PATH", default_value = "data/realt.sqlite")]
    db_path: String,

    /// Wallet whose purchases and sales are reconciled.
    #[arg(long, global = true, env = "REALT_WALLET_ADDRESS")]
    wallet: Option<String>,

    /// Previous wallet; enables wallet-transfer detection.
    #[arg(long, global = true, env = "REALT_OLD_WALLET_ADDRESS")]
    old_wallet: Option<String>,

    /// Lot order for sale allocation: discovery or chronological.
    #[arg(long, global = true, default_value = "discovery")]
    allocation_order: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch token transfers for the wallet into the store.
    Fetch(LedgerArgs),
    /// Import extracted invoices from JSON files.
    ImportInvoices(ImportInvoicesArgs),
    /// Match invoices and detect p2p and wallet-transfer purchases.
    Purchases,
    /// Pair sales and allocate them against purchases.
    Sales,
    /// Purchases then sales, optionally fetching first.
    Run(RunArgs),
    /// Print stored purchases and sales.
    Report(ReportArgs),
    Status,
}

#[derive(Args, Debug, Clone)]
struct LedgerArgs {
    #[arg(long, env = "REALT_API_KEY", default_value = "")]
    api_key: String,

    #[arg(long, env = "REALT_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Restrict the fetch to one token contract.
    #[arg(long)]
    contract: Option<String>,
}

#[derive(Args, Debug)]
struct ImportInvoicesArgs {
    #[arg(long, required = true)]
    json: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    fetch: bool,

    #[command(flatten)]
    ledger: LedgerArgs,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        db_path: cli.db_path,
        wallet: cli.wallet,
        old_wallet: cli.old_wallet,
        allocation_order: cli.allocation_order,
    };

    match cli.command {
        Commands::Fetch(args) => handle_fetch(&ctx, &args).await,
        Commands::ImportInvoices(args) => handle_import_invoices(&ctx, args).await,
        Commands::Purchases => handle_purchases(&ctx).await,
        Commands::Sales => handle_sales(&ctx).await,
        Commands::Run(args) => handle_run(&ctx, args).await,
        Commands::Report(args) => handle_report(&ctx, args).await,
        Commands::Status => handle_status(&ctx).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Engine configuration from the global options. Fails before any record is
/// loaded when the wallet is missing or malformed.
fn engine_config(ctx: &AppContext) -> Result<EngineConfig> {
    let order: AllocationOrder = ctx.allocation_order.parse()?;
    let config = EngineConfig::new(ctx.wallet.as_deref(), ctx.old_wallet.as_deref())
        .wrap_err("invalid engine configuration (set --wallet or REALT_WALLET_ADDRESS)")?;
    Ok(config.with_allocation_order(order))
}

fn open_store(ctx: &AppContext) -> Result<Store> {
    if let Some(parent) = std::path::Path::new(&ctx.db_path).parent() {
        if !parent.as_os_str().is_empty() && ctx.db_path != ":memory:" {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create data directory {}", parent.display()))?;
        }
    }
    Store::new(&ctx.db_path).wrap_err("failed to open SQLite store")
}

async fn handle_fetch(ctx: &AppContext, args: &LedgerArgs) -> Result<()> {
    let config = engine_config(ctx)?;
    if args.api_key.is_empty() {
        return Err(eyre!("REALT_API_KEY (or --api-key) is required for fetch"));
    }

    let store = open_store(ctx)?;
    let client = LedgerClient::new(&args.api_url, &args.api_key)?;
    let wallet = config.wallet.to_string();

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(format!("fetching token transfers for {wallet}"));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let transfers = client
        .fetch_token_transfers(&wallet, args.contract.as_deref())
        .await
        .wrap_err("failed to fetch token transfers")?;

    pb.set_message("storing transfers");
    let inserted = store
        .insert_transfers(&transfers)
        .wrap_err("failed to insert transfers")?;

    pb.finish_with_message("fetch completed");
    info!(
        fetched = transfers.len(),
        inserted,
        db_path = %ctx.db_path,
        "fetch command finished"
    );

    Ok(())
}

async fn handle_import_invoices(ctx: &AppContext, args: ImportInvoicesArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let mut imported = 0;

    for path in &args.json {
        imported += import_invoices(path, &store)
            .wrap_err_with(|| format!("failed to import {}", path.display()))?;
    }

    info!(files = args.json.len(), imported, "import-invoices completed");
    Ok(())
}

async fn handle_purchases(ctx: &AppContext) -> Result<()> {
    let config = engine_config(ctx)?;
    let store = open_store(ctx)?;

    let report = match_purchases(&config, &store)?;
    print_purchase_report(&report);
    Ok(())
}

async fn handle_sales(ctx: &AppContext) -> Result<()> {
    let config = engine_config(ctx)?;
    let store = open_store(ctx)?;

    let report = match_sales(&config, &store)?;
    print_sale_report(&report);
    Ok(())
}

async fn handle_run(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let config = engine_config(ctx)?;

    if args.fetch {
        handle_fetch(ctx, &args.ledger).await?;
    }

    let store = open_store(ctx)?;
    let purchases = match_purchases(&config, &store)?;
    let sales = match_sales(&config, &store)?;

    print_purchase_report(&purchases);
    print_sale_report(&sales);

    info!(
        purchases = purchases.total_purchases(),
        sales = sales.sales,
        order = %config.allocation_order,
        "run completed"
    );
    Ok(())
}

async fn handle_report(ctx: &AppContext, args: ReportArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let purchases = store.load_purchases().wrap_err("failed to load purchases")?;
    let sales = store.load_sales().wrap_err("failed to load sales")?;

    match args.output.as_str() {
        "table" => print_ledger_table(&purchases, &sales),
        "json" => print_ledger_json(&purchases, &sales)?,
        other => return Err(eyre!("unsupported output format '{other}' (use table or json)")),
    }
    Ok(())
}

async fn handle_status(ctx: &AppContext) -> Result<()> {
    let store = open_store(ctx)?;
    let counts = store.counts().wrap_err("failed to query record counts")?;

    let db_size_str = if ctx.db_path == ":memory:" {
        "N/A (in-memory)".to_string()
    } else {
        match std::fs::metadata(&ctx.db_path) {
            Ok(metadata) => format!("{} KB", metadata.len() / 1_000),
            Err(_) => "N/A (file not found)".to_string(),
        }
    };

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);

    table.add_row(vec!["Database Path", ctx.db_path.as_str()]);
    table.add_row(vec!["DB Size", &db_size_str]);
    table.add_row(vec!["Wallet", ctx.wallet.as_deref().unwrap_or("not configured")]);
    table.add_row(vec!["Transfers", &counts.transfers.to_string()]);
    table.add_row(vec!["Invoices", &counts.invoices.to_string()]);
    table.add_row(vec!["Purchases", &counts.purchases.to_string()]);
    table.add_row(vec!["Sales", &counts.sales.to_string()]);

    println!("\n{}\n", table);

    info!(
        transfers = counts.transfers,
        invoices = counts.invoices,
        purchases = counts.purchases,
        sales = counts.sales,
        db_path = %ctx.db_path,
        "status command completed"
    );

    Ok(())
}

fn skip_rows(table: &mut Table, skipped: &SkipCounters) {
    table.add_row(vec![
        "Skipped: malformed".to_string(),
        skipped.malformed_record.to_string(),
    ]);
    table.add_row(vec![
        "Skipped: bad date".to_string(),
        skipped.unparsable_date.to_string(),
    ]);
    table.add_row(vec![
        "Skipped: arithmetic".to_string(),
        skipped.arithmetic_failure.to_string(),
    ]);
}

fn print_purchase_report(report: &PurchaseReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Purchases", "Count"]);

    let matched = report.line_items - report.unmatched_line_items.len();
    table.add_row(vec!["Line items".to_string(), report.line_items.to_string()]);
    table.add_row(vec!["Line items matched".to_string(), matched.to_string()]);
    table.add_row(vec![
        "Invoices skipped".to_string(),
        report.invoices_skipped.to_string(),
    ]);
    table.add_row(vec!["P2P purchases".to_string(), report.p2p_purchases.to_string()]);
    table.add_row(vec![
        "Wallet transfers".to_string(),
        format!(
            "{} ({} with invoice)",
            report.transfer_purchases, report.transfers_with_invoice
        ),
    ]);
    table.add_row(vec![
        "Total purchases".to_string(),
        report.total_purchases().to_string(),
    ]);
    if report.overwritten_purchases > 0 {
        table.add_row(vec![
            "Overwritten (shared key)".to_string(),
            report.overwritten_purchases.to_string(),
        ]);
    }
    skip_rows(&mut table, &report.skipped);
    println!("\n{}\n", table);

    if report.unmatched_line_items.is_empty() {
        return;
    }

    let mut unmatched = Table::new();
    unmatched.load_preset(UTF8_BORDERS_ONLY);
    unmatched.set_header(vec!["Invoice", "Date", "Property", "Quantity", "Unit Price"]);
    for item in &report.unmatched_line_items {
        unmatched.add_row(vec![
            item.invoice_number.clone(),
            item.invoice_date.to_string(),
            item.property_address.clone(),
            item.quantity.normalize().to_string(),
            format_usd(item.unit_price_usd),
        ]);
    }
    println!("Unmatched line items:\n{}\n", unmatched);
}

fn print_sale_report(report: &SaleReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Sales", "Value"]);

    table.add_row(vec!["Sale pairs".to_string(), report.sale_pairs.to_string()]);
    table.add_row(vec!["Sales recorded".to_string(), report.sales.to_string()]);
    table.add_row(vec![
        "Unmatched (no lot)".to_string(),
        (report.unmatched_sales.len() - report.unpriced_sales()).to_string(),
    ]);
    table.add_row(vec![
        "Unmatched (unpriced lot)".to_string(),
        report.unpriced_sales().to_string(),
    ]);
    table.add_row(vec![
        "Total invested".to_string(),
        format_usd(report.total_invested_usd),
    ]);
    table.add_row(vec![
        "Total received".to_string(),
        format_usd(report.total_received_usd),
    ]);
    table.add_row(vec![
        "Overall ROI".to_string(),
        format_percent(report.overall_roi_percent),
    ]);
    skip_rows(&mut table, &report.skipped);
    println!("\n{}\n", table);
}

fn print_ledger_table(purchases: &[Purchase], sales: &[Sale]) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Source", "Property", "Quantity", "Unit Price", "Date", "Invoice", "Hash",
    ]);
    for p in purchases {
        table.add_row(vec![
            p.source.as_str().to_string(),
            p.property_address.clone(),
            p.quantity.normalize().to_string(),
            p.unit_price_usd.map_or_else(|| "-".to_string(), format_usd),
            p.transfer_date.format("%Y-%m-%d").to_string(),
            p.invoice_number.clone().unwrap_or_else(|| "-".to_string()),
            truncate_hash(&p.transaction_hash),
        ]);
    }
    println!("\nPurchases:\n{}\n", table);

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Property", "Quantity", "Buy", "Sell", "Received", "ROI", "Partial", "Sold", "Hash",
    ]);
    for s in sales {
        table.add_row(vec![
            s.property_address.clone(),
            s.quantity.normalize().to_string(),
            format_usd(s.buy_price_usd),
            format_usd(s.sell_price_usd),
            format!("{} {}", s.total_received_usd.round_dp(2), s.payment_currency),
            format_percent(Some(s.roi_percent)),
            if s.is_partial_sale { "yes" } else { "no" }.to_string(),
            s.sale_date.format("%Y-%m-%d").to_string(),
            truncate_hash(&s.sale_hash),
        ]);
    }
    println!("Sales:\n{}\n", table);

    let (invested, received, roi) = sale_totals(sales);
    println!("Summary:");
    for (source, count) in purchases_by_source(purchases) {
        println!("  {:<22} {}", format!("{} purchases:", source.as_str()), count);
    }
    println!("  {:<22} {}", "Sales:", sales.len());
    println!("  {:<22} {}", "Total invested:", format_usd(invested));
    println!("  {:<22} {}", "Total received:", format_usd(received));
    println!("  {:<22} {}\n", "Overall ROI:", format_percent(roi));
}

fn print_ledger_json(purchases: &[Purchase], sales: &[Sale]) -> Result<()> {
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct JsonOutput<'a> {
        purchases: &'a [Purchase],
        sales: &'a [Sale],
        summary: JsonSummary,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct JsonSummary {
        invoice_purchases: usize,
        p2p_purchases: usize,
        transfer_purchases: usize,
        sales: usize,
        total_invested_usd: Decimal,
        total_received_usd: Decimal,
        overall_roi_percent: Option<Decimal>,
    }

    let [(_, invoice), (_, p2p), (_, transfer)] = purchases_by_source(purchases);
    let (invested, received, roi) = sale_totals(sales);

    let output = JsonOutput {
        purchases,
        sales,
        summary: JsonSummary {
            invoice_purchases: invoice,
            p2p_purchases: p2p,
            transfer_purchases: transfer,
            sales: sales.len(),
            total_invested_usd: invested,
            total_received_usd: received,
            overall_roi_percent: roi,
        },
    };
    let json_str = serde_json::to_string_pretty(&output).wrap_err("failed to serialize JSON")?;
    println!("{}", json_str);

    Ok(())
}

fn format_usd(value: Decimal) -> String {
    format!("${:.2}", value)
}

fn format_percent(value: Option<Decimal>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{:.2}%", v))
}

/// Truncate a hex hash for compact table display.
fn truncate_hash(hash: &str) -> String {
    match (hash.get(..8), hash.get(hash.len().saturating_sub(4)..)) {
        (Some(head), Some(tail)) if hash.len() > 14 => format!("{head}…{tail}"),
        _ => hash.to_string(),
    }
}
