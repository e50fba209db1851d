use abc_core::*;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "abc-case")]
#[command(about = "Animal birth control case tracking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a case for a caught animal
    Catch {
        /// Where the animal was caught
        #[arg(long)]
        address: String,

        #[arg(long)]
        ward: Option<String>,

        #[arg(long)]
        remarks: Option<String>,

        /// Catching time (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Move a caught animal into a kennel
    Kennel { case_number: String },

    /// Record the surgery of a case and deduct its medicines
    Surgery {
        case_number: String,

        #[arg(long)]
        weight: f64,

        /// male or female
        #[arg(long)]
        gender: String,

        /// Record the surgery as cancelled for this reason
        #[arg(long)]
        cancel: Option<String>,

        #[arg(long)]
        remarks: Option<String>,

        #[arg(long)]
        at: Option<String>,
    },

    /// Record a post-operative treatment round
    Treat {
        case_number: String,

        /// Medicine given, as NAME=QUANTITY (repeatable)
        #[arg(long = "medicine")]
        medicines: Vec<String>,

        /// Normal Healing, Inflammation, Infection or Other
        #[arg(long, default_value = "normal healing")]
        wound: String,

        #[arg(long)]
        remarks: Option<String>,

        #[arg(long)]
        at: Option<String>,
    },

    /// Record a kennel feeding round and deduct the food
    Feed {
        /// morning or evening
        #[arg(long)]
        meal: String,

        /// Kennel fed (repeatable)
        #[arg(long = "kennel", required = true)]
        kennels: Vec<String>,

        /// Food given, as NAME=QUANTITY (repeatable)
        #[arg(long = "food", required = true)]
        foods: Vec<String>,

        #[arg(long)]
        remarks: Option<String>,

        #[arg(long)]
        at: Option<String>,
    },

    /// Stock usage per item over a month, a week of a month, or a date range
    Report {
        /// Month (YYYY-MM), defaults to the current month
        #[arg(long, conflicts_with_all = ["from", "to"])]
        month: Option<String>,

        /// Week of the month (1-5)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        week: Option<u32>,

        /// First day of a custom range (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Last day of a custom range (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<String>,
    },

    /// Record the release of an animal
    Release {
        case_number: String,

        #[arg(long)]
        remarks: Option<String>,

        #[arg(long)]
        at: Option<String>,
    },

    /// Record the death of an animal
    Mortality {
        case_number: String,

        #[arg(long)]
        cause: String,

        #[arg(long)]
        at: Option<String>,
    },

    /// Calculate medicine doses for an animal
    Dose {
        #[arg(long)]
        weight: f64,

        #[arg(long)]
        gender: String,

        /// Only show this drug
        #[arg(long)]
        drug: Option<String>,

        /// Compare the surgery plan against current stock
        #[arg(long)]
        check_stock: bool,
    },

    /// Show the medicine protocol
    Protocol {
        /// Write the protocol as TOML to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Show the number the next record would get
    NextNumber {
        /// Record type letter (C for catching, S for surgery)
        #[arg(long, default_value = "C")]
        record_type: String,

        /// Day within the month (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,
    },

    /// List cases
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one case as JSON
    Show { case_number: String },

    /// Manage medicine and food stock
    Stock {
        #[command(subcommand)]
        command: StockCommands,
    },

    /// Export all cases to CSV
    Export {
        /// Output file, defaults to cases.csv in the data directory
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Open cases for every row of a catching CSV
    Import { csv: PathBuf },

    /// Record surgeries for every row of a surgery CSV
    ImportSurgery { csv: PathBuf },
}

#[derive(Subcommand)]
enum StockCommands {
    /// Add stock
    Add {
        item: String,

        quantity: f64,

        #[arg(long, default_value = "ml")]
        unit: String,

        /// medicine or food
        #[arg(long, default_value = "medicine")]
        kind: String,
    },

    /// Deduct stock used outside surgery
    Use {
        item: String,

        quantity: f64,

        #[arg(long)]
        note: String,
    },

    /// Show current stock levels
    List,
}

fn main() -> Result<()> {
    // Initialize logging
    abc_core::logging::init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    std::fs::create_dir_all(&config.data.data_dir)?;

    let mut service = CaseService::from_config(&config)?;

    match cli.command {
        Commands::Catch {
            address,
            ward,
            remarks,
            at,
        } => cmd_catch(&service, address, ward, remarks, at),
        Commands::Kennel { case_number } => {
            let record = service.admit_to_kennel(&case_number)?;
            println!("✓ {} is {}", record.case_number, record.status);
            Ok(())
        }
        Commands::Surgery {
            case_number,
            weight,
            gender,
            cancel,
            remarks,
            at,
        } => cmd_surgery(
            &mut service,
            &case_number,
            weight,
            &gender,
            cancel,
            remarks,
            at,
        ),
        Commands::Treat {
            case_number,
            medicines,
            wound,
            remarks,
            at,
        } => cmd_treat(&mut service, &case_number, &medicines, &wound, remarks, at),
        Commands::Feed {
            meal,
            kennels,
            foods,
            remarks,
            at,
        } => cmd_feed(&mut service, &meal, kennels, &foods, remarks, at),
        Commands::Report {
            month,
            week,
            from,
            to,
        } => cmd_report(&service, month, week, from, to),
        Commands::Release {
            case_number,
            remarks,
            at,
        } => {
            let record = service.record_release(&case_number, parse_time(at)?, remarks)?;
            println!("✓ {} released", record.case_number);
            Ok(())
        }
        Commands::Mortality {
            case_number,
            cause,
            at,
        } => {
            let record = service.record_mortality(&case_number, parse_time(at)?, &cause)?;
            println!("✓ {} recorded as deceased ({})", record.case_number, cause);
            Ok(())
        }
        Commands::Dose {
            weight,
            gender,
            drug,
            check_stock,
        } => cmd_dose(&service, weight, &gender, drug, check_stock),
        Commands::Protocol { export } => cmd_protocol(&service, export),
        Commands::NextNumber { record_type, date } => {
            cmd_next_number(&service, &record_type, date)
        }
        Commands::List { status } => cmd_list(&service, status),
        Commands::Show { case_number } => {
            let record = service
                .store()
                .find_by_number(&case_number)?
                .ok_or_else(|| Error::NotFound(format!("Case {}", case_number)))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Stock { command } => cmd_stock(&mut service, command),
        Commands::Export { out } => {
            let out = out.unwrap_or_else(|| config.data.data_dir.join("cases.csv"));
            let records = service.store().list()?;
            let count = export_cases(&records, &out)?;
            println!("✓ Exported {} cases", count);
            println!("  CSV: {}", out.display());
            Ok(())
        }
        Commands::Import { csv } => cmd_import(&service, &csv),
        Commands::ImportSurgery { csv } => cmd_import_surgery(&mut service, &csv),
    }
}

/// Parse an RFC 3339 timestamp, defaulting to now
fn parse_time(at: Option<String>) -> Result<DateTime<Utc>> {
    match at {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::InvalidInput(format!("Invalid time '{}': {}", s, e))),
        None => Ok(Utc::now()),
    }
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::InvalidInput(format!("Invalid date '{}': {}", s, e)))
}

/// Split `NAME=QUANTITY` arguments
fn parse_quantities(pairs: &[String]) -> Result<Vec<(String, f64)>> {
    pairs
        .iter()
        .map(|pair| {
            let invalid = || Error::InvalidInput(format!("Expected NAME=QUANTITY, got '{}'", pair));
            let (name, quantity) = pair.rsplit_once('=').ok_or_else(invalid)?;
            let quantity: f64 = quantity.trim().parse().map_err(|_| invalid())?;
            Ok((name.trim().to_string(), quantity))
        })
        .collect()
}

fn cmd_catch(
    service: &CaseService,
    address: String,
    ward: Option<String>,
    remarks: Option<String>,
    at: Option<String>,
) -> Result<()> {
    let record = service.open_case(CatchingRecord {
        caught_at: parse_time(at)?,
        address,
        ward_number: ward,
        remarks,
    })?;

    println!("✓ Case created: {}", record.case_number);
    Ok(())
}

fn cmd_surgery(
    service: &mut CaseService,
    case_number: &str,
    weight: f64,
    gender: &str,
    cancel: Option<String>,
    remarks: Option<String>,
    at: Option<String>,
) -> Result<()> {
    let outcome = service.record_surgery(
        case_number,
        SurgeryRequest {
            recorded_at: parse_time(at)?,
            weight_kg: weight,
            gender: gender.parse()?,
            cancellation_reason: cancel,
            remarks,
        },
    )?;

    let Some(surgery) = &outcome.case.surgery else {
        return Err(Error::Other(format!("{} has no surgery record", case_number)));
    };

    if surgery.cancelled {
        println!("✓ Surgery cancelled for {}", outcome.case.case_number);
        return Ok(());
    }

    println!("✓ Surgery recorded for {}", outcome.case.case_number);
    if let Some(number) = &surgery.surgery_number {
        println!("  Surgery number: {}", number);
    }
    println!("  Type: {}", surgery.surgery_type);

    if surgery.medicines_used.is_empty() {
        println!("  No medicines calculated for {} kg", weight);
    } else {
        println!("  Medicines:");
        print_doses(&surgery.medicines_used, service.calculator().protocol());
    }
    if !outcome.movements.is_empty() {
        println!("  {} stock items deducted", outcome.movements.len());
    }

    Ok(())
}

fn cmd_treat(
    service: &mut CaseService,
    case_number: &str,
    medicines: &[String],
    wound: &str,
    remarks: Option<String>,
    at: Option<String>,
) -> Result<()> {
    let mut given = DosageResult::new();
    for (name, quantity) in parse_quantities(medicines)? {
        given.insert(DrugName::from(name.as_str()), quantity);
    }

    let outcome = service.record_treatment(
        case_number,
        TreatmentRequest {
            recorded_at: parse_time(at)?,
            medicines: given,
            wound_condition: wound.parse()?,
            remarks,
        },
    )?;

    let day = outcome
        .case
        .treatments
        .last()
        .map(|t| t.day_post_surgery)
        .unwrap_or_default();
    println!(
        "✓ Treatment day {} recorded for {} ({})",
        day, outcome.case.case_number, outcome.case.status
    );
    if !outcome.movements.is_empty() {
        println!("  {} stock items deducted", outcome.movements.len());
    }
    Ok(())
}

fn cmd_feed(
    service: &mut CaseService,
    meal: &str,
    kennels: Vec<String>,
    foods: &[String],
    remarks: Option<String>,
    at: Option<String>,
) -> Result<()> {
    let mut food_items = BTreeMap::new();
    for (name, quantity) in parse_quantities(foods)? {
        *food_items.entry(name).or_insert(0.0) += quantity;
    }

    let outcome = service.record_feeding(FeedingRequest {
        fed_at: parse_time(at)?,
        meal_time: meal.parse()?,
        kennel_numbers: kennels,
        food_items,
        remarks,
    })?;

    println!(
        "✓ {} feeding recorded for {} kennels",
        outcome.feeding.meal_time,
        outcome.feeding.kennel_numbers.len()
    );
    for movement in &outcome.movements {
        println!("  {:<20} -{}", movement.item, movement.quantity);
    }
    Ok(())
}

fn cmd_report(
    service: &CaseService,
    month: Option<String>,
    week: Option<u32>,
    from: Option<String>,
    to: Option<String>,
) -> Result<()> {
    let period = match (from, to) {
        (Some(from), Some(to)) => UsagePeriod::Custom {
            start: parse_day(&from)?,
            end: parse_day(&to)?,
        },
        _ => {
            let month = month.unwrap_or_else(|| Utc::now().format("%Y-%m").to_string());
            match week {
                Some(week) => UsagePeriod::week(&month, week)?,
                None => UsagePeriod::month(&month)?,
            }
        }
    };

    let report = service.usage_report(period)?;
    println!("Stock usage for {} ({} to {})", report.name, report.start, report.end);
    if report.items.is_empty() {
        println!("No stock movements in this period.");
        return Ok(());
    }

    println!(
        "  {:<20} {:>10} {:>10} {:>10} {:>10}  {}",
        "Item", "Used", "Restocked", "Adjusted", "In stock", "Cases"
    );
    for (item, usage) in &report.items {
        let in_stock = usage
            .current_stock
            .map(|stock| format!("{} {}", stock, usage.unit.as_deref().unwrap_or_default()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:>10} {:>10} {:>10} {:>10}  {}",
            item,
            usage.used,
            usage.restocked,
            usage.adjusted,
            in_stock,
            usage.cases.len()
        );
    }
    Ok(())
}

fn cmd_dose(
    service: &CaseService,
    weight: f64,
    gender: &str,
    drug: Option<String>,
    check_stock: bool,
) -> Result<()> {
    dosage::validate_weight(weight)?;
    let gender: Gender = gender.parse()?;
    let calculator = service.calculator();

    if let Some(drug) = drug {
        let dose = calculator.compute_dose(weight, &drug, gender);
        let unit = calculator
            .protocol()
            .get(&drug)
            .map(|rule| rule.unit.to_string())
            .unwrap_or_default();
        println!("{}: {} {}", drug, dose, unit);
        return Ok(());
    }

    let plan = calculator.compute_all(weight, gender).retain_positive();
    println!("Doses for {} kg {}:", weight, gender);
    print_doses(&plan, calculator.protocol());

    if check_stock {
        let shortfalls = service.shortfalls(&plan)?;
        if shortfalls.is_empty() {
            println!("✓ Stock is sufficient");
        } else {
            println!("Insufficient stock:");
            for shortfall in shortfalls {
                match shortfall.available {
                    Some(available) => println!(
                        "  {}: need {}, have {}",
                        shortfall.item, shortfall.required, available
                    ),
                    None => println!(
                        "  {}: need {}, not stocked",
                        shortfall.item, shortfall.required
                    ),
                }
            }
        }
    }

    Ok(())
}

fn print_doses(plan: &DosageResult, protocol: &ProtocolTable) {
    for (drug, dose) in plan.iter() {
        let unit = protocol
            .get(drug.as_str())
            .map(|rule| rule.unit.to_string())
            .unwrap_or_default();
        println!("  {:<20} {} {}", drug, dose, unit);
    }
}

fn cmd_protocol(service: &CaseService, export: Option<PathBuf>) -> Result<()> {
    let protocol = service.calculator().protocol();

    if let Some(path) = export {
        std::fs::write(&path, protocol.to_toml()?)?;
        println!("✓ Protocol written to {}", path.display());
        return Ok(());
    }

    for rule in protocol.rules() {
        let mode = match &rule.mode {
            DosageMode::Fixed => "fixed".to_string(),
            DosageMode::PerTenKg { max_cap, rounding } => {
                let mut mode = "per 10 kg".to_string();
                if let Some(cap) = max_cap {
                    mode.push_str(&format!(", max {}", cap));
                }
                if *rounding != RoundingPolicy::None {
                    mode.push_str(&format!(", {:?}", rounding));
                }
                mode
            }
        };
        let female = if rule.female_only { " (female only)" } else { "" };
        println!(
            "  {:<20} {} {} {}{}",
            rule.name, rule.base_dose, rule.unit, mode, female
        );
    }

    Ok(())
}

fn cmd_next_number(service: &CaseService, record_type: &str, date: Option<String>) -> Result<()> {
    let record_type: RecordType = record_type.parse()?;
    let at = match date {
        Some(d) => parse_day(&d)?
            .and_hms_opt(12, 0, 0)
            .ok_or_else(|| Error::InvalidInput(format!("Invalid date '{}'", d)))?
            .and_utc(),
        None => Utc::now(),
    };

    println!("{}", service.preview_number(record_type, at)?);
    Ok(())
}

fn cmd_list(service: &CaseService, status: Option<String>) -> Result<()> {
    let status: Option<CaseStatus> = status.map(|s| s.parse()).transpose()?;
    let records = service.store().list()?;

    let mut shown = 0;
    for record in records
        .iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
    {
        println!(
            "{}  {:<18} {}  {}",
            record.case_number,
            record.status.to_string(),
            record.catching.caught_at.format("%Y-%m-%d %H:%M"),
            record.catching.address
        );
        shown += 1;
    }

    if shown == 0 {
        println!("No cases found.");
    }
    Ok(())
}

fn cmd_stock(service: &mut CaseService, command: StockCommands) -> Result<()> {
    match command {
        StockCommands::Add {
            item,
            quantity,
            unit,
            kind,
        } => {
            let kind: StockKind = kind.parse()?;
            service.restock(&item, kind, &unit, quantity, Utc::now())?;
            let inventory = service.load_inventory()?;
            if let Some(stock) = inventory.get(&item) {
                println!("✓ {} now at {} {}", item, stock.current_stock, stock.unit);
            }
        }
        StockCommands::Use {
            item,
            quantity,
            note,
        } => {
            service.record_misc_use(&item, quantity, &note, Utc::now())?;
            println!("✓ Deducted {} of {}", quantity, item);
        }
        StockCommands::List => {
            let inventory = service.load_inventory()?;
            if inventory.items.is_empty() {
                println!("No stock recorded.");
            }
            for item in inventory.items.values() {
                println!(
                    "  {:<20} {:>10} {:<4} {:?}",
                    item.name, item.current_stock, item.unit, item.kind
                );
            }
        }
    }
    Ok(())
}

fn cmd_import(service: &CaseService, csv: &std::path::Path) -> Result<()> {
    let report = import_catching(service, csv)?;

    println!("✓ Imported {} cases", report.created.len());
    for number in &report.created {
        println!("  {}", number);
    }
    if !report.errors.is_empty() {
        println!("Skipped {} rows:", report.errors.len());
        for (row, reason) in &report.errors {
            println!("  row {}: {}", row, reason);
        }
    }
    Ok(())
}

fn cmd_import_surgery(service: &mut CaseService, csv: &std::path::Path) -> Result<()> {
    let report = import_surgery(service, csv)?;

    println!("✓ Recorded {} surgeries", report.created.len());
    for number in &report.created {
        println!("  {}", number);
    }
    if !report.medicines_deducted.is_empty() {
        println!("Medicines deducted:");
        for (item, quantity) in &report.medicines_deducted {
            println!("  {:<20} {}", item, quantity);
        }
    }
    if !report.errors.is_empty() {
        println!("Skipped {} rows:", report.errors.len());
        for (row, reason) in &report.errors {
            println!("  row {}: {}", row, reason);
        }
    }
    Ok(())
}
