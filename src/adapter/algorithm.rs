//! Algorithm catalogue.
//!
//! Each algorithm carries the implementation guidance injected into the
//! generation prompt and whether it needs a target column.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::AdapterError;

/// Algorithm the generated pipeline should implement.
///
/// Deserializes through [`FromStr`], so aliases such as `kmeans` are accepted
/// on the wire; serializes as the snake-case tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlgorithmType {
    LinearRegression,
    LogisticRegression,
    DecisionTree,
    RandomForest,
    ClusteringKmeans,
    ClusteringHierarchical,
    AnomalyDetection,
    TimeSeries,
    AssociationRules,
    LinearProgramming,
    MixedIntegerProgramming,
    ReinforcementLearning,
    AutoMl,
}

impl AlgorithmType {
    /// All algorithms, in catalogue order.
    pub const ALL: [AlgorithmType; 13] = [
        AlgorithmType::LinearRegression,
        AlgorithmType::LogisticRegression,
        AlgorithmType::DecisionTree,
        AlgorithmType::RandomForest,
        AlgorithmType::ClusteringKmeans,
        AlgorithmType::ClusteringHierarchical,
        AlgorithmType::AnomalyDetection,
        AlgorithmType::TimeSeries,
        AlgorithmType::AssociationRules,
        AlgorithmType::LinearProgramming,
        AlgorithmType::MixedIntegerProgramming,
        AlgorithmType::ReinforcementLearning,
        AlgorithmType::AutoMl,
    ];

    /// Snake-case tag, also the expected `model_type` in the report.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmType::LinearRegression => "linear_regression",
            AlgorithmType::LogisticRegression => "logistic_regression",
            AlgorithmType::DecisionTree => "decision_tree",
            AlgorithmType::RandomForest => "random_forest",
            AlgorithmType::ClusteringKmeans => "clustering_kmeans",
            AlgorithmType::ClusteringHierarchical => "clustering_hierarchical",
            AlgorithmType::AnomalyDetection => "anomaly_detection",
            AlgorithmType::TimeSeries => "time_series",
            AlgorithmType::AssociationRules => "association_rules",
            AlgorithmType::LinearProgramming => "linear_programming",
            AlgorithmType::MixedIntegerProgramming => "mixed_integer_programming",
            AlgorithmType::ReinforcementLearning => "reinforcement_learning",
            AlgorithmType::AutoMl => "auto_ml",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            AlgorithmType::LinearRegression => "Linear Regression",
            AlgorithmType::LogisticRegression => "Logistic Regression",
            AlgorithmType::DecisionTree => "Decision Tree",
            AlgorithmType::RandomForest => "Random Forest",
            AlgorithmType::ClusteringKmeans => "K-Means Clustering",
            AlgorithmType::ClusteringHierarchical => "Hierarchical Clustering",
            AlgorithmType::AnomalyDetection => "Anomaly Detection",
            AlgorithmType::TimeSeries => "Time Series Forecasting",
            AlgorithmType::AssociationRules => "Association Rules",
            AlgorithmType::LinearProgramming => "Linear Programming",
            AlgorithmType::MixedIntegerProgramming => "Mixed Integer Programming",
            AlgorithmType::ReinforcementLearning => "Reinforcement Learning",
            AlgorithmType::AutoMl => "AutoML",
        }
    }

    /// Whether the report must name a target column.
    pub fn is_supervised(&self) -> bool {
        matches!(
            self,
            AlgorithmType::LinearRegression
                | AlgorithmType::LogisticRegression
                | AlgorithmType::DecisionTree
                | AlgorithmType::RandomForest
                | AlgorithmType::TimeSeries
                | AlgorithmType::AutoMl
        )
    }

    /// Implementation guidance for the generation prompt.
    pub fn guidance(&self) -> &'static str {
        match self {
            AlgorithmType::LinearRegression => {
                "Use sklearn.linear_model.LinearRegression on a numeric target. Hold out 20% \
                 for testing. Report mse, rmse and r2. Use absolute coefficients as shap_importance."
            }
            AlgorithmType::LogisticRegression => {
                "Use sklearn.linear_model.LogisticRegression (max_iter=1000) on a categorical or \
                 binary target. Report accuracy, precision, recall and f1 (weighted average)."
            }
            AlgorithmType::DecisionTree => {
                "Use a DecisionTreeClassifier or DecisionTreeRegressor depending on the target \
                 type, max_depth=5. Report accuracy/f1 or mse/r2. Use feature_importances_ as \
                 shap_importance."
            }
            AlgorithmType::RandomForest => {
                "Use a RandomForestClassifier or RandomForestRegressor depending on the target \
                 type, n_estimators=100, random_state=42. Report accuracy/f1 or mse/r2. Use \
                 feature_importances_ as shap_importance."
            }
            AlgorithmType::ClusteringKmeans => {
                "Scale numeric columns with StandardScaler and fit sklearn KMeans (pick k in 2..8 \
                 by silhouette score). No target. Report silhouette, inertia and n_clusters. Put \
                 up to 500 rows with their cluster label in visualization_data."
            }
            AlgorithmType::ClusteringHierarchical => {
                "Scale numeric columns and fit AgglomerativeClustering (ward linkage) on at most \
                 5000 sampled rows. No target. Report silhouette and n_clusters. Put up to 500 \
                 rows with their cluster label in visualization_data."
            }
            AlgorithmType::AnomalyDetection => {
                "Scale numeric columns, fill missing values with the column mean and fit \
                 IsolationForest(contamination=0.05, random_state=42). No target. Report \
                 total_rows, anomalies_found and anomaly_ratio. Put the top anomalies in \
                 visualization_data."
            }
            AlgorithmType::TimeSeries => {
                "Find a date/time column and a numeric value column, resample to a regular \
                 frequency and fit statsmodels ARIMA(1,1,1) on the first 80%. Forecast the rest \
                 and report mse and mae. The value column is the target."
            }
            AlgorithmType::AssociationRules => {
                "Build a one-hot basket matrix from transactional columns and mine frequent \
                 itemsets with mlxtend apriori (min_support=0.01), then association_rules on \
                 lift. No target. Report n_itemsets, n_rules and max_lift."
            }
            AlgorithmType::LinearProgramming => {
                "Formulate an optimisation over the numeric columns with scipy.optimize.linprog \
                 (or PuLP if available). No target. Report objective_value and n_variables; \
                 metrics must be numbers."
            }
            AlgorithmType::MixedIntegerProgramming => {
                "Formulate an integer optimisation with PuLP (CBC solver) over the numeric \
                 columns. No target. Report objective_value, n_variables and solve_status as a \
                 number (1 = optimal)."
            }
            AlgorithmType::ReinforcementLearning => {
                "Derive a small discrete environment from the data and train tabular \
                 Q-learning with numpy for a bounded number of episodes. No target. Report \
                 mean_reward and episodes."
            }
            AlgorithmType::AutoMl => {
                "Try LinearRegression/LogisticRegression, RandomForest and GradientBoosting \
                 with 3-fold cross validation, keep the best. Report the best score under its \
                 metric name plus cv_mean. Set model_type to auto_ml."
            }
        }
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AlgorithmType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let algorithm = match normalized.as_str() {
            "linear_regression" | "linear" | "regression" => AlgorithmType::LinearRegression,
            "logistic_regression" | "logistic" | "classification" => AlgorithmType::LogisticRegression,
            "decision_tree" | "tree" => AlgorithmType::DecisionTree,
            "random_forest" | "forest" => AlgorithmType::RandomForest,
            "clustering_kmeans" | "kmeans" | "k_means" | "clustering" => AlgorithmType::ClusteringKmeans,
            "clustering_hierarchical" | "hierarchical" => AlgorithmType::ClusteringHierarchical,
            "anomaly_detection" | "anomaly" | "isolation_forest" => AlgorithmType::AnomalyDetection,
            "time_series" | "timeseries" | "forecast" | "forecasting" => AlgorithmType::TimeSeries,
            "association_rules" | "apriori" | "market_basket" => AlgorithmType::AssociationRules,
            "linear_programming" | "lp" => AlgorithmType::LinearProgramming,
            "mixed_integer_programming" | "mip" | "milp" => AlgorithmType::MixedIntegerProgramming,
            "reinforcement_learning" | "rl" | "q_learning" => AlgorithmType::ReinforcementLearning,
            "auto_ml" | "automl" | "auto" => AlgorithmType::AutoMl,
            _ => return Err(AdapterError::UnknownAlgorithm(s.to_string())),
        };
        Ok(algorithm)
    }
}

impl TryFrom<String> for AlgorithmType {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlgorithmType> for String {
    fn from(algorithm: AlgorithmType) -> Self {
        algorithm.as_str().to_string()
    }
}
