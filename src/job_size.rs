//! Job-size constraints for a user operation: explicit job-count override,
//! data-weight-per-job-derived count with a small-foreign-ratio branch,
//! clamps by max job count/row count/output-table product, and
//! sampling-rate scaling.

fn div_ceil(a: i64, b: i64) -> i64 {
    assert!(b > 0, "div_ceil divisor must be positive");
    if a <= 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

#[derive(Debug, Clone)]
pub struct JobSizeSpec {
    pub job_count: Option<i64>,
    pub data_weight_per_job: Option<i64>,
    pub max_job_count: Option<i64>,
    pub max_data_weight_per_job: i64,
    pub sampling_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct JobSizeOptions {
    pub default_data_weight_per_job: i64,
    pub max_job_count: i64,
    pub max_output_tables_times_jobs_count: i64,
    pub io_block_size: i64,
    pub max_total_slice_count: i64,
}

#[derive(Debug, Clone)]
pub struct JobSizeInput {
    pub input_data_weight: i64,
    pub primary_input_data_weight: i64,
    pub input_row_count: i64,
    pub data_weight_ratio: f64,
    pub output_table_count: i64,
    pub input_table_count: i64,
}

const SMALL_FOREIGN_RATIO: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct JobSizeConstraints {
    pub job_count: i64,
    pub data_weight_per_job: i64,
    pub primary_data_weight_per_job: i64,
    pub sampling_data_weight_per_job: Option<i64>,
    pub sampling_primary_data_weight_per_job: Option<i64>,
}

/// Derive `(jobCount, dataWeightPerJob, primaryDataWeightPerJob)` for the
/// user-operation variant.
pub fn compute_user_job_size_constraints(
    spec: &JobSizeSpec,
    options: &JobSizeOptions,
    input: &JobSizeInput,
) -> JobSizeConstraints {
    let foreign_input_data_weight = input.input_data_weight - input.primary_input_data_weight;
    assert!(foreign_input_data_weight >= 0, "primary data weight must not exceed total input data weight");

    let initial_input_data_weight = input.input_data_weight;
    let initial_primary_input_data_weight = input.primary_input_data_weight;

    let (input_data_weight, primary_input_data_weight, input_row_count) =
        if let Some(rate) = spec.sampling_rate {
            (
                scale(input.input_data_weight, rate),
                scale(input.primary_input_data_weight, rate),
                scale(input.input_row_count, rate),
            )
        } else {
            (input.input_data_weight, input.primary_input_data_weight, input.input_row_count)
        };

    let is_small_foreign_ratio = {
        let ratio = if primary_input_data_weight > 0 {
            (input_data_weight - primary_input_data_weight) as f64 / primary_input_data_weight as f64
        } else {
            0.0
        };
        ratio < SMALL_FOREIGN_RATIO
    };

    let mut job_count = if let Some(n) = spec.job_count {
        n
    } else if primary_input_data_weight > 0 {
        let mut data_weight_per_job = spec.data_weight_per_job.unwrap_or(options.default_data_weight_per_job);
        if input.data_weight_ratio < 1.0 {
            data_weight_per_job = ((data_weight_per_job as f64) * input.data_weight_ratio).max(1.0) as i64;
        }

        if is_small_foreign_ratio {
            div_ceil(primary_input_data_weight, data_weight_per_job)
                .max(div_ceil(input_data_weight, div_ceil(spec.max_data_weight_per_job, 2)))
        } else {
            div_ceil(input_data_weight, data_weight_per_job)
        }
    } else {
        0
    };

    let mut max_job_count = options.max_job_count;
    if let Some(n) = spec.max_job_count {
        max_job_count = max_job_count.min(n);
    }
    job_count = job_count.min(max_job_count);
    job_count = job_count.min(input_row_count);

    if job_count * input.output_table_count > options.max_output_tables_times_jobs_count {
        job_count = div_ceil(options.max_output_tables_times_jobs_count, input.output_table_count);
    }
    assert!(job_count >= 0);

    let data_weight_per_job = if job_count == 0 {
        1
    } else if is_small_foreign_ratio {
        div_ceil(input_data_weight, job_count).min(2 * primary_data_weight_per_job(primary_input_data_weight, job_count))
    } else {
        div_ceil(input_data_weight, job_count)
    };

    let primary_data_weight_per_job = primary_data_weight_per_job(primary_input_data_weight, job_count);

    let (sampling_data_weight_per_job, sampling_primary_data_weight_per_job) = match spec.sampling_rate {
        Some(_) => {
            // Each sampling job contributes up to inputTableCount slices in
            // the worst case, so the slice budget bounds the job count.
            let min_for_io = input.input_table_count * options.io_block_size;
            let min_primary_for_io = options.io_block_size;
            let max_job_count_for_slice_fit = (options.max_total_slice_count / input.input_table_count.max(1)).max(1);
            let min_for_slice_fit = initial_input_data_weight / max_job_count_for_slice_fit;
            let min_primary_for_slice_fit = initial_primary_input_data_weight / max_job_count_for_slice_fit;
            (
                Some(*[1, min_for_io, min_for_slice_fit].iter().max().unwrap()),
                Some(*[1, min_primary_for_io, min_primary_for_slice_fit].iter().max().unwrap()),
            )
        }
        None => (None, None),
    };

    JobSizeConstraints {
        job_count,
        data_weight_per_job,
        primary_data_weight_per_job,
        sampling_data_weight_per_job,
        sampling_primary_data_weight_per_job,
    }
}

fn primary_data_weight_per_job(primary_input_data_weight: i64, job_count: i64) -> i64 {
    if job_count > 0 {
        div_ceil(primary_input_data_weight, job_count).max(1)
    } else {
        1
    }
}

fn scale(value: i64, rate: f64) -> i64 {
    ((value as f64) * rate) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> JobSizeOptions {
        JobSizeOptions {
            default_data_weight_per_job: 256 << 20,
            max_job_count: 100_000,
            max_output_tables_times_jobs_count: 20_000_000,
            io_block_size: 4 << 20,
            max_total_slice_count: 10_000_000,
        }
    }

    #[test]
    fn explicit_job_count_is_used_verbatim() {
        let spec = JobSizeSpec {
            job_count: Some(7),
            data_weight_per_job: None,
            max_job_count: None,
            max_data_weight_per_job: i64::MAX / 4,
            sampling_rate: None,
        };
        let input = JobSizeInput {
            input_data_weight: 1_000_000,
            primary_input_data_weight: 1_000_000,
            input_row_count: 1_000,
            data_weight_ratio: 1.0,
            output_table_count: 1,
            input_table_count: 1,
        };
        let result = compute_user_job_size_constraints(&spec, &base_options(), &input);
        assert_eq!(result.job_count, 7);
    }

    #[test]
    fn small_foreign_ratio_bases_count_on_primary_weight() {
        let spec = JobSizeSpec {
            job_count: None,
            data_weight_per_job: Some(1000),
            max_job_count: None,
            max_data_weight_per_job: 100_000,
            sampling_rate: None,
        };
        let input = JobSizeInput {
            input_data_weight: 10_100,
            primary_input_data_weight: 10_000,
            input_row_count: i64::MAX / 4,
            data_weight_ratio: 1.0,
            output_table_count: 1,
            input_table_count: 1,
        };
        let result = compute_user_job_size_constraints(&spec, &base_options(), &input);
        // primary/dwpj = ceil(10000/1000) = 10; input/ceil(maxDwpj/2) = ceil(10100/50000) = 1
        assert_eq!(result.job_count, 10);
    }

    #[test]
    fn job_count_clamped_by_row_count() {
        let spec = JobSizeSpec {
            job_count: None,
            data_weight_per_job: Some(1),
            max_job_count: None,
            max_data_weight_per_job: i64::MAX / 4,
            sampling_rate: None,
        };
        let input = JobSizeInput {
            input_data_weight: 1_000_000,
            primary_input_data_weight: 1_000_000,
            input_row_count: 5,
            data_weight_ratio: 1.0,
            output_table_count: 1,
            input_table_count: 1,
        };
        let result = compute_user_job_size_constraints(&spec, &base_options(), &input);
        assert_eq!(result.job_count, 5);
    }

    #[test]
    fn job_count_clamped_by_output_tables_times_jobs() {
        let mut options = base_options();
        options.max_output_tables_times_jobs_count = 20;
        let spec = JobSizeSpec {
            job_count: Some(100),
            data_weight_per_job: None,
            max_job_count: None,
            max_data_weight_per_job: i64::MAX / 4,
            sampling_rate: None,
        };
        let input = JobSizeInput {
            input_data_weight: 1_000_000,
            primary_input_data_weight: 1_000_000,
            input_row_count: i64::MAX / 4,
            data_weight_ratio: 1.0,
            output_table_count: 4,
            input_table_count: 1,
        };
        let result = compute_user_job_size_constraints(&spec, &base_options_with(options), &input);
        assert_eq!(result.job_count, 5); // ceil(20/4)
    }

    fn base_options_with(o: JobSizeOptions) -> JobSizeOptions {
        o
    }

    #[test]
    fn zero_primary_weight_yields_zero_jobs_and_unit_weight() {
        let spec = JobSizeSpec {
            job_count: None,
            data_weight_per_job: None,
            max_job_count: None,
            max_data_weight_per_job: i64::MAX / 4,
            sampling_rate: None,
        };
        let input = JobSizeInput {
            input_data_weight: 0,
            primary_input_data_weight: 0,
            input_row_count: 0,
            data_weight_ratio: 1.0,
            output_table_count: 1,
            input_table_count: 1,
        };
        let result = compute_user_job_size_constraints(&spec, &base_options(), &input);
        assert_eq!(result.job_count, 0);
        assert_eq!(result.data_weight_per_job, 1);
    }
}
